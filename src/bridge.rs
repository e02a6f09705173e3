//! The system-bus side of the server.
//!
//! Owns everything that touches `dbus`: acquiring the connection, claiming
//! the well-known name, dispatching inbound method/property calls into the
//! object model, discovering BlueZ's GATT manager, registering the
//! application, and emitting `PropertiesChanged` signals.
//!
//! Inbound dispatch runs on the connection's IO task via a single
//! `start_receive` vtable; handlers must therefore never block.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::channel::Sender;
use dbus::message::{MatchRule, SignalArgs};
use dbus::nonblock::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged;
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Message;
use tracing::{debug, error, info, warn};

use crate::builder::ServerDescription;
use crate::gatt::{ChangeNotifier, InterfaceContext, MethodReply};
use crate::introspect::introspection_xml;
use crate::object_path::ObjectPath;
use crate::value::DataValue;

pub(crate) const BLUEZ_BUS_NAME: &str = "org.bluez";
pub(crate) const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const DBUS_FAILED_ERROR: &str = "org.freedesktop.DBus.Error.Failed";

const BLUEZ_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Emits `PropertiesChanged` signals on the live connection. This is the
/// `ChangeNotifier` the model sees once the bus is up.
pub(crate) struct DbusNotifier {
    conn: Arc<SyncConnection>,
}

impl DbusNotifier {
    pub(crate) fn new(conn: Arc<SyncConnection>) -> DbusNotifier {
        DbusNotifier { conn }
    }
}

impl ChangeNotifier for DbusNotifier {
    fn property_changed(&self, path: &ObjectPath, interface_name: &str, value: &DataValue) {
        let mut changed = PropMap::new();
        changed.insert("Value".to_string(), value.to_variant());

        let signal = PropertiesPropertiesChanged {
            interface_name: interface_name.to_string(),
            changed_properties: changed,
            invalidated_properties: Vec::new(),
        };
        let msg = signal.to_emit_message(&dbus::Path::from(path.as_str().to_string()));
        if self.conn.send(msg).is_err() {
            warn!(
                "failed to emit PropertiesChanged for '{}' on {}",
                interface_name, path
            );
        }
    }
}

/// Handle one inbound method call. Returns the reply to send, or `None`
/// when the message is not something we answer (no path/member).
pub(crate) fn dispatch_method_call(
    msg: &Message,
    conn: &Arc<SyncConnection>,
    description: &ServerDescription,
) -> Option<Message> {
    let path = msg.path()?.to_string();
    let member = msg.member()?.to_string();
    let interface_name = msg.interface().map(|i| i.to_string()).unwrap_or_default();

    let reply = match interface_name.as_str() {
        INTROSPECTABLE_INTERFACE if member == "Introspect" => {
            introspect_reply(msg, description, &path)
        }
        PROPERTIES_INTERFACE => properties_reply(msg, conn, description, &path, &member),
        _ => gatt_reply(msg, conn, description, &path, &interface_name, &member),
    };

    Some(reply)
}

fn introspect_reply(msg: &Message, description: &ServerDescription, path: &str) -> Message {
    match description.tree().find_object(path) {
        Some(object) => {
            let xml = introspection_xml(description.tree(), description.service_name(), object);
            msg.method_return().append1(xml)
        }
        None => failed_reply(msg, &format!("no object at path '{}'", path)),
    }
}

fn properties_reply(
    msg: &Message,
    conn: &Arc<SyncConnection>,
    description: &ServerDescription,
    path: &str,
    member: &str,
) -> Message {
    let tree = description.tree();
    let notifier = DbusNotifier::new(conn.clone());

    match member {
        "Get" => {
            let (iface_name, prop_name): (String, String) = match msg.read2() {
                Ok(args) => args,
                Err(e) => return failed_reply(msg, &format!("bad Get arguments: {}", e)),
            };
            let detail = format!("[{}]:[{}]:[{}]", path, iface_name, prop_name);

            let Some((object, interface, property)) =
                tree.find_property(path, &iface_name, &prop_name)
            else {
                error!("property(get) not found: {}", detail);
                return failed_reply(msg, &format!("Property(get) not found: {}", detail));
            };
            let Some(getter) = &property.getter else {
                error!("property(get) func not found: {}", detail);
                return failed_reply(msg, &format!("Property(get) func not found: {}", detail));
            };

            let ctx = InterfaceContext {
                tree,
                object,
                interface,
                data: description.data(),
                notifier: &notifier,
                args: None,
            };
            match getter(&ctx) {
                Some(value) => msg.method_return().append1(value.to_variant()),
                None => failed_reply(msg, &format!("Property(get) failed: {}", detail)),
            }
        }
        "Set" => {
            let (iface_name, prop_name, value): (String, String, Variant<Box<dyn RefArg>>) =
                match msg.read3() {
                    Ok(args) => args,
                    Err(e) => return failed_reply(msg, &format!("bad Set arguments: {}", e)),
                };
            let detail = format!("[{}]:[{}]:[{}]", path, iface_name, prop_name);

            let Some((object, interface, property)) =
                tree.find_property(path, &iface_name, &prop_name)
            else {
                error!("property(set) not found: {}", detail);
                return failed_reply(msg, &format!("Property(set) not found: {}", detail));
            };
            let Some(setter) = &property.setter else {
                error!("property(set) func not found: {}", detail);
                return failed_reply(msg, &format!("Property(set) func not found: {}", detail));
            };
            let Some(decoded) = DataValue::from_ref_arg(value.0.as_ref()) else {
                return failed_reply(msg, &format!("Property(set) unsupported value: {}", detail));
            };

            let ctx = InterfaceContext {
                tree,
                object,
                interface,
                data: description.data(),
                notifier: &notifier,
                args: None,
            };
            if setter(&ctx, &decoded) {
                msg.method_return()
            } else {
                failed_reply(msg, &format!("Property(set) failed: {}", detail))
            }
        }
        "GetAll" => {
            let iface_name: String = match msg.read1() {
                Ok(args) => args,
                Err(e) => return failed_reply(msg, &format!("bad GetAll arguments: {}", e)),
            };

            let Some((object, interface)) = tree.find_interface(path, &iface_name) else {
                return failed_reply(
                    msg,
                    &format!("GetAll: no interface '{}' at '{}'", iface_name, path),
                );
            };

            let ctx = InterfaceContext {
                tree,
                object,
                interface,
                data: description.data(),
                notifier: &notifier,
                args: None,
            };
            let mut props = PropMap::new();
            for property in &interface.properties {
                let value = property
                    .getter
                    .as_ref()
                    .and_then(|getter| getter(&ctx))
                    .unwrap_or_else(|| property.value.clone());
                props.insert(property.name.clone(), value.to_variant());
            }
            msg.method_return().append1(props)
        }
        other => failed_reply(msg, &format!("unsupported Properties member '{}'", other)),
    }
}

fn gatt_reply(
    msg: &Message,
    conn: &Arc<SyncConnection>,
    description: &ServerDescription,
    path: &str,
    interface_name: &str,
    member: &str,
) -> Message {
    let tree = description.tree();

    let found = tree
        .find_interface(path, interface_name)
        .and_then(|(object, interface)| {
            interface
                .find_method(member)
                .map(|method| (object, interface, method))
        });

    let Some((object, interface, method)) = found else {
        error!(
            "method not found: [{}]:[{}]:[{}]",
            path, interface_name, member
        );
        return not_implemented_reply(msg, description);
    };

    // Write-style methods lead with a byte-array payload.
    let args = if method.in_args.first().map(String::as_str) == Some("ay") {
        match msg.read1::<Vec<u8>>() {
            Ok(bytes) => Some(bytes),
            Err(e) => return failed_reply(msg, &format!("bad byte-array argument: {}", e)),
        }
    } else {
        None
    };

    let notifier = DbusNotifier::new(conn.clone());
    let ctx = InterfaceContext {
        tree,
        object,
        interface,
        data: description.data(),
        notifier: &notifier,
        args,
    };

    match (method.handler)(&ctx) {
        Ok(MethodReply::Empty) => msg.method_return(),
        Ok(MethodReply::Bytes(bytes)) => msg.method_return().append1(bytes),
        Ok(MethodReply::ManagedObjects(snapshot)) => {
            debug!("serving GetManagedObjects ({} objects)", snapshot.len());
            msg.method_return().append1(snapshot_to_dbus(snapshot))
        }
        Err(e) => failed_reply(msg, &format!("{} failed: {:#}", member, e)),
    }
}

fn snapshot_to_dbus(
    snapshot: crate::gatt::ManagedObjectsSnapshot,
) -> HashMap<dbus::Path<'static>, HashMap<String, PropMap>> {
    let mut objects = HashMap::new();
    for (path, interfaces) in snapshot {
        let mut interface_map = HashMap::new();
        for (interface_name, properties) in interfaces {
            let mut props = PropMap::new();
            for (name, value) in properties {
                props.insert(name, value.to_variant());
            }
            interface_map.insert(interface_name, props);
        }
        objects.insert(dbus::Path::from(path.as_str().to_string()), interface_map);
    }
    objects
}

fn not_implemented_reply(msg: &Message, description: &ServerDescription) -> Message {
    error_reply(
        msg,
        &description.not_implemented_error(),
        "This method is not implemented",
    )
}

fn failed_reply(msg: &Message, text: &str) -> Message {
    error_reply(msg, DBUS_FAILED_ERROR, text)
}

fn error_reply(msg: &Message, error_name: &str, text: &str) -> Message {
    let text = CString::new(text.replace('\0', " ")).unwrap_or_default();
    msg.error(&error_name.into(), &text)
}

const DBUS_DAEMON: &str = "org.freedesktop.DBus";
const DBUS_DAEMON_PATH: &str = "/org/freedesktop/DBus";
const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;
const NAME_REPLY_PRIMARY_OWNER: u32 = 1;

fn daemon_proxy(conn: &Arc<SyncConnection>) -> Proxy<'static, Arc<SyncConnection>> {
    Proxy::new(DBUS_DAEMON, DBUS_DAEMON_PATH, BLUEZ_CALL_TIMEOUT, conn.clone())
}

/// Ask the bus for our well-known name. `true` means we are primary owner.
pub(crate) async fn request_owned_name(conn: &Arc<SyncConnection>, name: &str) -> Result<bool> {
    let (reply,): (u32,) = daemon_proxy(conn)
        .method_call(
            DBUS_DAEMON,
            "RequestName",
            (name, NAME_FLAG_REPLACE_EXISTING | NAME_FLAG_DO_NOT_QUEUE),
        )
        .await
        .with_context(|| format!("requesting bus name '{}'", name))?;

    if reply == NAME_REPLY_PRIMARY_OWNER {
        Ok(true)
    } else {
        warn!("bus name '{}' not acquired (reply {})", name, reply);
        Ok(false)
    }
}

/// Give the owned name back (shutdown path).
pub(crate) async fn release_owned_name(conn: &Arc<SyncConnection>, name: &str) {
    let result: Result<(u32,), dbus::Error> = daemon_proxy(conn)
        .method_call(DBUS_DAEMON, "ReleaseName", (name,))
        .await;
    if let Err(e) = result {
        warn!("failed to release bus name '{}': {}", name, e);
    }
}

/// Watch for losing the owned name; `on_lost` fires from the IO task.
pub(crate) async fn watch_name_lost(
    conn: &Arc<SyncConnection>,
    name: String,
    on_lost: impl Fn() + Send + Sync + 'static,
) -> Result<MsgMatch> {
    let rule = MatchRule::new_signal("org.freedesktop.DBus", "NameLost");
    let mm = conn
        .add_match(rule)
        .await
        .context("subscribing to NameLost")?
        .cb(move |_msg, (lost,): (String,)| {
            if lost == name {
                warn!("owned name '{}' lost", lost);
                on_lost();
            }
            true
        });
    Ok(mm)
}

/// The BlueZ adapter object we registered against: the first object that
/// offers `GattManager1` (and the Adapter1/Properties interfaces we may
/// want later).
#[derive(Debug, Clone)]
pub(crate) struct BluezAdapter {
    pub path: dbus::Path<'static>,
}

impl BluezAdapter {
    #[allow(dead_code)]
    pub(crate) fn adapter_proxy<'a>(
        &'a self,
        conn: &Arc<SyncConnection>,
    ) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_BUS_NAME, self.path.clone(), BLUEZ_CALL_TIMEOUT, conn.clone())
    }
}

/// One-shot scan of BlueZ's managed objects for a GATT manager.
pub(crate) async fn find_gatt_manager(
    conn: &Arc<SyncConnection>,
) -> Result<Option<BluezAdapter>> {
    let proxy = Proxy::new(BLUEZ_BUS_NAME, "/", BLUEZ_CALL_TIMEOUT, conn.clone());
    let (objects,): (HashMap<dbus::Path<'static>, HashMap<String, PropMap>>,) = proxy
        .method_call("org.freedesktop.DBus.ObjectManager", "GetManagedObjects", ())
        .await
        .context("listing org.bluez managed objects")?;

    // Hash order is arbitrary; sort so "the first adapter" is stable.
    let mut paths: Vec<_> = objects.keys().cloned().collect();
    paths.sort_by(|a, b| (**a).cmp(&**b));

    for path in paths {
        let interfaces = &objects[&path];
        if !interfaces.contains_key(GATT_MANAGER_INTERFACE) {
            continue;
        }
        if !interfaces.contains_key(ADAPTER_INTERFACE) {
            warn!("'{}' has a GATT manager but no Adapter1 interface", path);
            continue;
        }
        info!("found BlueZ GATT manager at '{}'", path);
        return Ok(Some(BluezAdapter { path }));
    }

    Ok(None)
}

/// Register our application (rooted at `/`, where the object manager lives)
/// with the BlueZ GATT manager.
pub(crate) async fn register_application(
    conn: &Arc<SyncConnection>,
    adapter: &BluezAdapter,
) -> Result<()> {
    let proxy = Proxy::new(
        BLUEZ_BUS_NAME,
        adapter.path.clone(),
        BLUEZ_CALL_TIMEOUT,
        conn.clone(),
    );
    let options = PropMap::new();
    let () = proxy
        .method_call(
            GATT_MANAGER_INTERFACE,
            "RegisterApplication",
            (dbus::Path::from("/"), options),
        )
        .await
        .context("RegisterApplication")?;

    debug!("GATT application registered with BlueZ");
    Ok(())
}
