//! Declarative construction of a server description.
//!
//! The tree is declared root-down: services contain characteristics,
//! characteristics contain descriptors. Each level is configured inside a
//! closure, which keeps the nesting visible in the source the same way the
//! paths nest on the bus:
//!
//! ```no_run
//! use gatt_server::builder::ServerBuilder;
//!
//! let description = ServerBuilder::new("demo", "Demo", "demo")
//!     .service("device", "180A", |service| {
//!         service.characteristic("mfgr_name", "2A29", &["read"], |chr| {
//!             chr.on_read(|_ctx| Ok(b"Acme Inc.".to_vec()));
//!         });
//!     })
//!     .build()
//!     .unwrap();
//! ```
//!
//! Standard properties are attached automatically: `UUID` and `Primary` for
//! services; `UUID`, `Service` and `Flags` for characteristics; `UUID`,
//! `Characteristic` and `Flags` for descriptors. The object-manager root
//! (publish = false) and its `GetManagedObjects` method are part of every
//! description.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::gatt::{
    GattProperty, Interface, InterfaceContext, InterfaceKind, Method, MethodReply, ObjectId,
    ObjectTree, ServerData, TickEvent,
};
use crate::gatt_uuid::GattUuid;
use crate::object_path::ObjectPath;
use crate::value::DataValue;

/// Interface names fixed by the BlueZ GATT D-Bus API.
pub const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

const CHARACTERISTIC_FLAGS: &[&str] = &[
    "broadcast",
    "read",
    "write-without-response",
    "write",
    "notify",
    "indicate",
    "authenticated-signed-writes",
    "reliable-write",
    "writable-auxiliaries",
    "encrypt-read",
    "encrypt-write",
    "encrypt-authenticated-read",
    "encrypt-authenticated-write",
    "secure-read",
    "secure-write",
];

const DESCRIPTOR_FLAGS: &[&str] = &[
    "read",
    "write",
    "encrypt-read",
    "encrypt-write",
    "encrypt-authenticated-read",
    "encrypt-authenticated-write",
    "secure-read",
    "secure-write",
];

/// A complete, immutable server description: the object tree plus the
/// adapter configuration the bridge reconciles toward.
pub struct ServerDescription {
    pub(crate) tree: ObjectTree,
    pub(crate) service_name: String,
    pub(crate) advertising_name: String,
    pub(crate) advertising_short_name: String,
    pub(crate) enable_bredr: bool,
    pub(crate) enable_secure_connection: bool,
    pub(crate) enable_connectable: bool,
    pub(crate) enable_advertising: bool,
    pub(crate) enable_bondable: bool,
    pub(crate) data: ServerData,
}

impl ServerDescription {
    /// The well-known bus name this server claims.
    pub fn owned_name(&self) -> String {
        format!("com.{}", self.service_name)
    }

    /// The publish root under which all services live.
    pub fn root_path(&self) -> ObjectPath {
        ObjectPath::root().append("com").append(&self.service_name)
    }

    /// Error name returned for unknown methods.
    pub fn not_implemented_error(&self) -> String {
        format!("{}.NotImplemented", self.owned_name())
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn advertising_name(&self) -> &str {
        &self.advertising_name
    }

    pub fn advertising_short_name(&self) -> &str {
        &self.advertising_short_name
    }

    pub fn tree(&self) -> &ObjectTree {
        &self.tree
    }

    pub fn data(&self) -> &ServerData {
        &self.data
    }
}

/// Top-level builder. Consumed by `build`.
pub struct ServerBuilder {
    tree: ObjectTree,
    root: ObjectId,
    service_name: String,
    advertising_name: String,
    advertising_short_name: String,
    enable_bredr: bool,
    enable_secure_connection: bool,
    enable_connectable: bool,
    enable_advertising: bool,
    enable_bondable: bool,
    data: ServerData,
    error: Option<anyhow::Error>,
}

impl ServerBuilder {
    /// Start a description. `service_name` is lower-cased and becomes both
    /// the owned name (`com.<name>`) and the root path (`/com/<name>`).
    pub fn new(
        service_name: &str,
        advertising_name: &str,
        advertising_short_name: &str,
    ) -> ServerBuilder {
        let service_name = service_name.to_lowercase();
        let mut error = None;
        if !ObjectPath::is_valid_segment(&service_name) {
            error = Some(anyhow!("'{}' is not a usable service name", service_name));
        }

        let mut tree = ObjectTree::new();

        // BlueZ requires the standard ObjectManager on the root service
        // path; it is infrastructure and never published as a GATT service.
        let om_root = tree.add_root("", false);
        let mut om = Interface::new(OBJECT_MANAGER_INTERFACE, InterfaceKind::Plain);
        om.methods.push(Method {
            name: "GetManagedObjects".to_string(),
            in_args: Vec::new(),
            out_args: Some("a{oa{sa{sv}}}".to_string()),
            handler: Arc::new(|ctx: &InterfaceContext<'_>| {
                Ok(MethodReply::ManagedObjects(ctx.tree.managed_objects()))
            }),
        });
        if let Err(e) = tree.add_interface(om_root, om) {
            error = error.or(Some(e));
        }

        let root = tree.add_root(&format!("com/{}", service_name), true);

        ServerBuilder {
            tree,
            root,
            service_name,
            advertising_name: advertising_name.to_string(),
            advertising_short_name: advertising_short_name.to_string(),
            enable_bredr: false,
            enable_secure_connection: false,
            enable_connectable: true,
            enable_advertising: true,
            enable_bondable: false,
            data: ServerData::empty(),
            error: None,
        }
        .stash_error(error)
    }

    fn stash_error(mut self, error: Option<anyhow::Error>) -> ServerBuilder {
        if self.error.is_none() {
            self.error = error;
        }
        self
    }

    /// Install the host data accessors.
    pub fn data(mut self, data: ServerData) -> ServerBuilder {
        self.data = data;
        self
    }

    pub fn enable_bredr(mut self, on: bool) -> ServerBuilder {
        self.enable_bredr = on;
        self
    }

    pub fn enable_secure_connection(mut self, on: bool) -> ServerBuilder {
        self.enable_secure_connection = on;
        self
    }

    pub fn enable_connectable(mut self, on: bool) -> ServerBuilder {
        self.enable_connectable = on;
        self
    }

    pub fn enable_advertising(mut self, on: bool) -> ServerBuilder {
        self.enable_advertising = on;
        self
    }

    pub fn enable_bondable(mut self, on: bool) -> ServerBuilder {
        self.enable_bondable = on;
        self
    }

    /// Declare a GATT service at `/com/<name>/<node>`.
    pub fn service(
        mut self,
        node: &str,
        uuid: &str,
        configure: impl FnOnce(&mut ServiceBuilder<'_>),
    ) -> ServerBuilder {
        if self.error.is_some() {
            return self;
        }

        let result = (|| -> Result<ObjectId> {
            let uuid = GattUuid::parse(uuid)?;
            let object = self.tree.add_child(self.root, node)?;

            let mut interface = Interface::new(SERVICE_INTERFACE, InterfaceKind::Service);
            interface
                .properties
                .push(GattProperty::fixed("UUID", DataValue::Text(uuid.as_str().into())));
            interface
                .properties
                .push(GattProperty::fixed("Primary", DataValue::Boolean(true)));
            self.tree.add_interface(object, interface)?;
            Ok(object)
        })();

        match result {
            Ok(object) => {
                let mut service = ServiceBuilder {
                    tree: &mut self.tree,
                    object,
                    error: &mut self.error,
                };
                configure(&mut service);
                self
            }
            Err(e) => self.stash_error(Some(e)),
        }
    }

    /// Finish the description.
    pub fn build(self) -> Result<ServerDescription> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(ServerDescription {
            tree: self.tree,
            service_name: self.service_name,
            advertising_name: self.advertising_name,
            advertising_short_name: self.advertising_short_name,
            enable_bredr: self.enable_bredr,
            enable_secure_connection: self.enable_secure_connection,
            enable_connectable: self.enable_connectable,
            enable_advertising: self.enable_advertising,
            enable_bondable: self.enable_bondable,
            data: self.data,
        })
    }
}

/// Configures one service; created by [`ServerBuilder::service`].
pub struct ServiceBuilder<'a> {
    tree: &'a mut ObjectTree,
    object: ObjectId,
    error: &'a mut Option<anyhow::Error>,
}

impl<'a> ServiceBuilder<'a> {
    /// Declare a characteristic below this service.
    pub fn characteristic(
        &mut self,
        node: &str,
        uuid: &str,
        flags: &[&str],
        configure: impl FnOnce(&mut CharacteristicBuilder<'_>),
    ) -> &mut Self {
        if self.error.is_some() {
            return self;
        }

        let service_path = self.tree.full_path(self.object);
        let result = (|| -> Result<ObjectId> {
            let uuid = GattUuid::parse(uuid)?;
            validate_flags(flags, CHARACTERISTIC_FLAGS, "characteristic")?;

            let object = self.tree.add_child(self.object, node)?;
            let mut interface =
                Interface::new(CHARACTERISTIC_INTERFACE, InterfaceKind::Characteristic);
            interface
                .properties
                .push(GattProperty::fixed("UUID", DataValue::Text(uuid.as_str().into())));
            interface.properties.push(GattProperty::fixed(
                "Service",
                DataValue::Path(service_path.as_str().into()),
            ));
            interface.properties.push(GattProperty::fixed(
                "Flags",
                DataValue::TextList(flags.iter().map(|f| f.to_string()).collect()),
            ));
            self.tree.add_interface(object, interface)?;
            Ok(object)
        })();

        match result {
            Ok(object) => {
                let mut characteristic = CharacteristicBuilder {
                    tree: &mut *self.tree,
                    object,
                    error: &mut *self.error,
                };
                configure(&mut characteristic);
            }
            Err(e) => {
                if self.error.is_none() {
                    *self.error = Some(e);
                }
            }
        }
        self
    }
}

/// Configures one characteristic; created by
/// [`ServiceBuilder::characteristic`].
pub struct CharacteristicBuilder<'a> {
    tree: &'a mut ObjectTree,
    object: ObjectId,
    error: &'a mut Option<anyhow::Error>,
}

impl<'a> CharacteristicBuilder<'a> {
    /// Handle the standard `ReadValue` call. The returned bytes become the
    /// characteristic's value on the wire.
    pub fn on_read(
        &mut self,
        handler: impl Fn(&InterfaceContext<'_>) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_method(
            "ReadValue",
            vec!["a{sv}".to_string()],
            Some("ay".to_string()),
            Arc::new(move |ctx: &InterfaceContext<'_>| handler(ctx).map(MethodReply::Bytes)),
        )
    }

    /// Handle the standard `WriteValue` call. The handler receives the
    /// written bytes; an empty reply is still sent so the client does not
    /// observe an ATT failure.
    pub fn on_write(
        &mut self,
        handler: impl Fn(&InterfaceContext<'_>, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_method(
            "WriteValue",
            vec!["ay".to_string(), "a{sv}".to_string()],
            None,
            Arc::new(move |ctx: &InterfaceContext<'_>| {
                let bytes = ctx.args.clone().unwrap_or_default();
                handler(ctx, &bytes)?;
                Ok(MethodReply::Empty)
            }),
        )
    }

    /// Install the on-updated hook, called from the idle drain whenever an
    /// update for this characteristic is queued.
    pub fn on_updated(
        &mut self,
        hook: impl Fn(&InterfaceContext<'_>) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        if let Some(interface) = self.tree.interface_mut(self.object, CHARACTERISTIC_INTERFACE) {
            interface.on_updated = Some(Arc::new(hook));
        }
        self
    }

    /// Run `handler` every `frequency` ticks of the periodic timer.
    pub fn on_event(
        &mut self,
        frequency: u32,
        handler: impl Fn(&InterfaceContext<'_>) + Send + Sync + 'static,
    ) -> &mut Self {
        if let Some(interface) = self.tree.interface_mut(self.object, CHARACTERISTIC_INTERFACE) {
            interface
                .tick_events
                .push(TickEvent::new(frequency, Arc::new(handler)));
        }
        self
    }

    /// Declare a descriptor below this characteristic.
    pub fn descriptor(
        &mut self,
        node: &str,
        uuid: &str,
        flags: &[&str],
        configure: impl FnOnce(&mut DescriptorBuilder<'_>),
    ) -> &mut Self {
        if self.error.is_some() {
            return self;
        }

        let characteristic_path = self.tree.full_path(self.object);
        let result = (|| -> Result<ObjectId> {
            let uuid = GattUuid::parse(uuid)?;
            validate_flags(flags, DESCRIPTOR_FLAGS, "descriptor")?;

            let object = self.tree.add_child(self.object, node)?;
            let mut interface = Interface::new(DESCRIPTOR_INTERFACE, InterfaceKind::Descriptor);
            interface
                .properties
                .push(GattProperty::fixed("UUID", DataValue::Text(uuid.as_str().into())));
            interface.properties.push(GattProperty::fixed(
                "Characteristic",
                DataValue::Path(characteristic_path.as_str().into()),
            ));
            interface.properties.push(GattProperty::fixed(
                "Flags",
                DataValue::TextList(flags.iter().map(|f| f.to_string()).collect()),
            ));
            self.tree.add_interface(object, interface)?;
            Ok(object)
        })();

        match result {
            Ok(object) => {
                let mut descriptor = DescriptorBuilder {
                    tree: &mut *self.tree,
                    object,
                    error: &mut *self.error,
                };
                configure(&mut descriptor);
            }
            Err(e) => {
                if self.error.is_none() {
                    *self.error = Some(e);
                }
            }
        }
        self
    }

    fn add_method(
        &mut self,
        name: &str,
        in_args: Vec<String>,
        out_args: Option<String>,
        handler: crate::gatt::MethodHandler,
    ) -> &mut Self {
        if let Some(interface) = self.tree.interface_mut(self.object, CHARACTERISTIC_INTERFACE) {
            interface.methods.push(Method {
                name: name.to_string(),
                in_args,
                out_args,
                handler,
            });
        }
        self
    }
}

/// Configures one descriptor; created by
/// [`CharacteristicBuilder::descriptor`].
pub struct DescriptorBuilder<'a> {
    tree: &'a mut ObjectTree,
    object: ObjectId,
    #[allow(dead_code)]
    error: &'a mut Option<anyhow::Error>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn on_read(
        &mut self,
        handler: impl Fn(&InterfaceContext<'_>) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_method(
            "ReadValue",
            vec!["a{sv}".to_string()],
            Some("ay".to_string()),
            Arc::new(move |ctx: &InterfaceContext<'_>| handler(ctx).map(MethodReply::Bytes)),
        )
    }

    pub fn on_write(
        &mut self,
        handler: impl Fn(&InterfaceContext<'_>, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.add_method(
            "WriteValue",
            vec!["ay".to_string(), "a{sv}".to_string()],
            None,
            Arc::new(move |ctx: &InterfaceContext<'_>| {
                let bytes = ctx.args.clone().unwrap_or_default();
                handler(ctx, &bytes)?;
                Ok(MethodReply::Empty)
            }),
        )
    }

    fn add_method(
        &mut self,
        name: &str,
        in_args: Vec<String>,
        out_args: Option<String>,
        handler: crate::gatt::MethodHandler,
    ) -> &mut Self {
        if let Some(interface) = self.tree.interface_mut(self.object, DESCRIPTOR_INTERFACE) {
            interface.methods.push(Method {
                name: name.to_string(),
                in_args,
                out_args,
                handler,
            });
        }
        self
    }
}

fn validate_flags(flags: &[&str], allowed: &[&str], kind: &str) -> Result<()> {
    for flag in flags {
        if !allowed.contains(flag) {
            return Err(anyhow!("'{}' is not a valid {} flag", flag, kind));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::NullNotifier;

    fn demo() -> ServerDescription {
        ServerBuilder::new("Demo", "Demo Server", "demo")
            .service("device", "180A", |service| {
                service.characteristic("mfgr", "2A29", &["read"], |chr| {
                    chr.on_read(|_ctx| Ok(b"Acme Inc.".to_vec()));
                });
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_names_and_paths_derive_from_lowercased_service_name() {
        let description = demo();
        assert_eq!(description.service_name(), "demo");
        assert_eq!(description.owned_name(), "com.demo");
        assert_eq!(description.root_path().as_str(), "/com/demo");
        assert_eq!(description.not_implemented_error(), "com.demo.NotImplemented");
    }

    #[test]
    fn test_demo_tree_paths() {
        let description = demo();
        let tree = description.tree();

        assert!(tree.find_object("/com/demo").is_some());
        assert!(tree.find_interface("/com/demo/device", SERVICE_INTERFACE).is_some());
        assert!(tree
            .find_interface("/com/demo/device/mfgr", CHARACTERISTIC_INTERFACE)
            .is_some());
    }

    #[test]
    fn test_characteristic_service_property_is_parent_path() {
        let description = demo();
        let tree = description.tree();

        let (object, iface) = tree
            .find_interface("/com/demo/device/mfgr", CHARACTERISTIC_INTERFACE)
            .unwrap();
        let service_prop = iface.find_property("Service").unwrap();
        let parent = tree.parent(object).unwrap();
        assert_eq!(
            service_prop.value,
            DataValue::Path(tree.full_path(parent).as_str().into())
        );
    }

    #[test]
    fn test_descriptor_characteristic_property_is_parent_path() {
        let description = ServerBuilder::new("demo", "", "")
            .service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |service| {
                service.characteristic(
                    "string",
                    "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
                    &["read", "write", "notify"],
                    |chr| {
                        chr.descriptor("description", "2901", &["read"], |desc| {
                            desc.on_read(|_ctx| Ok(b"A mutable test string".to_vec()));
                        });
                    },
                );
            })
            .build()
            .unwrap();

        let tree = description.tree();
        let (object, iface) = tree
            .find_interface("/com/demo/text/string/description", DESCRIPTOR_INTERFACE)
            .unwrap();
        let prop = iface.find_property("Characteristic").unwrap();
        let parent = tree.parent(object).unwrap();
        assert_eq!(
            prop.value,
            DataValue::Path(tree.full_path(parent).as_str().into())
        );
    }

    #[test]
    fn test_managed_objects_cover_the_publish_subtree() {
        let description = demo();
        let snapshot = description.tree().managed_objects();

        let paths: Vec<&str> = snapshot.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/com/demo/device", "/com/demo/device/mfgr"]);

        let device = &snapshot[0].1;
        assert_eq!(device[0].0, SERVICE_INTERFACE);
        assert!(device[0].1.iter().any(|(n, v)| {
            n == "UUID" && *v == DataValue::Text("0000180A-0000-1000-8000-00805F9B34FB".into())
        }));
        assert!(device[0]
            .1
            .iter()
            .any(|(n, v)| n == "Primary" && *v == DataValue::Boolean(true)));
    }

    #[test]
    fn test_read_value_returns_host_bytes() {
        let description = demo();
        let tree = description.tree();
        let (object, iface) = tree
            .find_interface("/com/demo/device/mfgr", CHARACTERISTIC_INTERFACE)
            .unwrap();

        let method = iface.find_method("ReadValue").unwrap();
        let ctx = InterfaceContext {
            tree,
            object,
            interface: iface,
            data: description.data(),
            notifier: &NullNotifier,
            args: None,
        };
        match (method.handler)(&ctx).unwrap() {
            MethodReply::Bytes(bytes) => assert_eq!(bytes, b"Acme Inc."),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_flags_fail_the_build() {
        let result = ServerBuilder::new("demo", "", "")
            .service("device", "180A", |service| {
                service.characteristic("x", "2A29", &["read", "fly"], |_chr| {});
            })
            .build();
        assert!(result.is_err());

        let result = ServerBuilder::new("demo", "", "")
            .service("device", "180A", |service| {
                service.characteristic("x", "2A29", &["read"], |chr| {
                    // "notify" is not a descriptor flag.
                    chr.descriptor("d", "2901", &["notify"], |_| {});
                });
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_uuid_fails_the_build() {
        let result = ServerBuilder::new("demo", "", "")
            .service("device", "nope", |_service| {})
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_exactly_one_object_manager_interface() {
        let description = demo();
        let tree = description.tree();

        let mut count = 0;
        for &root in tree.roots() {
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                let node = tree.node(id);
                for iface in node.interfaces() {
                    if iface.name == OBJECT_MANAGER_INTERFACE {
                        count += 1;
                        assert!(!node.is_published());
                    }
                }
                stack.extend_from_slice(node.children());
            }
        }
        assert_eq!(count, 1);
    }
}
