//! The published object tree: objects, interfaces, properties, methods and
//! tick events.
//!
//! Objects live in an arena indexed by `ObjectId`; parent/child links are
//! indices, and full paths are computed by walking upward. Interfaces are a
//! shared record with a kind tag (service / characteristic / descriptor /
//! plain); the tag drives kind-specific dispatch. The tree's shape is fixed
//! once the server starts - only tick counters and host data mutate after
//! construction.
//!
//! The model is bus-agnostic: handlers produce [`MethodReply`] values and
//! emit change notifications through the [`ChangeNotifier`] seam, which the
//! bus bridge implements against the live connection and tests implement
//! with a recorder.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::debug;

use crate::object_path::ObjectPath;
use crate::value::DataValue;

pub type ObjectId = usize;

/// Kind tag for an interface attached to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Infrastructure interfaces (object manager, plain D-Bus interfaces).
    Plain,
    Service,
    Characteristic,
    Descriptor,
}

/// Host data accessors. The getter is called on the main loop thread and
/// must return stable data; the setter must copy before returning.
pub struct ServerData {
    pub getter: Box<dyn Fn(&str) -> Option<DataValue> + Send + Sync>,
    pub setter: Box<dyn Fn(&str, &DataValue) -> bool + Send + Sync>,
}

impl ServerData {
    /// Accessors that know no keys; useful for servers whose characteristics
    /// close over their own state.
    pub fn empty() -> ServerData {
        ServerData {
            getter: Box::new(|_| None),
            setter: Box::new(|_, _| false),
        }
    }
}

/// Sends property-change signals for updated characteristic values.
pub trait ChangeNotifier: Send + Sync {
    fn property_changed(&self, path: &ObjectPath, interface_name: &str, value: &DataValue);
}

/// Notifier used before the bus exists (and while tearing down).
pub struct NullNotifier;

impl ChangeNotifier for NullNotifier {
    fn property_changed(&self, _path: &ObjectPath, _interface_name: &str, _value: &DataValue) {}
}

/// Snapshot shape of `GetManagedObjects`:
/// object path -> interface name -> property name -> value.
pub type ManagedObjectsSnapshot = Vec<(ObjectPath, Vec<(String, Vec<(String, DataValue)>)>)>;

/// What a method handler hands back to the bus bridge.
#[derive(Debug)]
pub enum MethodReply {
    /// An empty `method_return` (still required by write-style methods so
    /// the client does not see an ATT error).
    Empty,
    /// A byte-array return (`ay`), the `ReadValue` shape.
    Bytes(Vec<u8>),
    /// The object-manager snapshot (`a{oa{sa{sv}}}`).
    ManagedObjects(ManagedObjectsSnapshot),
}

/// Everything a callback can reach: the tree, its own interface, the host
/// data accessors and the notification seam. This is the `self` handle the
/// builder callbacks receive.
pub struct InterfaceContext<'a> {
    pub tree: &'a ObjectTree,
    pub object: ObjectId,
    pub interface: &'a Interface,
    pub data: &'a ServerData,
    pub notifier: &'a dyn ChangeNotifier,
    /// Byte payload of write-style methods; `None` for reads.
    pub args: Option<Vec<u8>>,
}

impl<'a> InterfaceContext<'a> {
    /// Full bus path of the object this interface lives on.
    pub fn path(&self) -> ObjectPath {
        self.tree.full_path(self.object)
    }

    /// Fetch a value from the host's data getter.
    pub fn get_data(&self, key: &str) -> Option<DataValue> {
        (self.data.getter)(key)
    }

    /// Push a value through the host's data setter.
    pub fn set_data(&self, key: &str, value: &DataValue) -> bool {
        (self.data.setter)(key, value)
    }

    /// Emit a `PropertiesChanged` carrying this interface's new value.
    pub fn notify_value(&self, value: &DataValue) {
        self.notifier
            .property_changed(&self.path(), &self.interface.name, value);
    }

    /// Invoke the characteristic's on-updated hook, if one is set.
    pub fn call_on_updated(&self) -> bool {
        match &self.interface.on_updated {
            Some(hook) => {
                debug!(
                    "calling on-updated hook for interface at path '{}'",
                    self.path()
                );
                hook(self)
            }
            None => false,
        }
    }
}

pub type MethodHandler = Arc<dyn Fn(&InterfaceContext<'_>) -> Result<MethodReply> + Send + Sync>;
pub type UpdatedValueHook = Arc<dyn Fn(&InterfaceContext<'_>) -> bool + Send + Sync>;
pub type TickHandler = Arc<dyn Fn(&InterfaceContext<'_>) + Send + Sync>;
pub type PropertyGetter = Arc<dyn Fn(&InterfaceContext<'_>) -> Option<DataValue> + Send + Sync>;
pub type PropertySetter = Arc<dyn Fn(&InterfaceContext<'_>, &DataValue) -> bool + Send + Sync>;

/// A callable member of an interface.
pub struct Method {
    pub name: String,
    pub in_args: Vec<String>,
    pub out_args: Option<String>,
    pub handler: MethodHandler,
}

/// A named, typed property with optional live accessors.
pub struct GattProperty {
    pub name: String,
    pub value: DataValue,
    pub getter: Option<PropertyGetter>,
    pub setter: Option<PropertySetter>,
}

impl GattProperty {
    pub fn fixed(name: &str, value: DataValue) -> GattProperty {
        GattProperty {
            name: name.to_string(),
            value,
            getter: None,
            setter: None,
        }
    }
}

/// A periodic callback owned by an interface. The engine's ~1 s timer ticks
/// it; after `frequency` ticks the handler fires and the counter resets.
pub struct TickEvent {
    pub frequency: u32,
    elapsed: AtomicU32,
    pub handler: TickHandler,
}

impl TickEvent {
    pub fn new(frequency: u32, handler: TickHandler) -> TickEvent {
        TickEvent {
            frequency: frequency.max(1),
            elapsed: AtomicU32::new(0),
            handler,
        }
    }

    fn tick(&self, ctx: &InterfaceContext<'_>) {
        let elapsed = self.elapsed.fetch_add(1, Ordering::Relaxed) + 1;
        if elapsed >= self.frequency {
            self.elapsed.store(0, Ordering::Relaxed);
            (self.handler)(ctx);
        }
    }
}

/// A named capability attached to an object.
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    pub methods: Vec<Method>,
    pub properties: Vec<GattProperty>,
    pub tick_events: Vec<TickEvent>,
    /// Characteristics only: called from the idle drain when the host (or a
    /// remote write) reports an updated value.
    pub on_updated: Option<UpdatedValueHook>,
}

impl Interface {
    pub fn new(name: &str, kind: InterfaceKind) -> Interface {
        Interface {
            name: name.to_string(),
            kind,
            methods: Vec::new(),
            properties: Vec::new(),
            tick_events: Vec::new(),
            on_updated: None,
        }
    }

    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn find_property(&self, name: &str) -> Option<&GattProperty> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// One node of the published tree.
pub struct ObjectNode {
    /// Path node relative to the parent (roots may carry several segments).
    path_node: String,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    interfaces: Vec<Interface>,
    publish: bool,
}

impl ObjectNode {
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn path_node(&self) -> &str {
        &self.path_node
    }

    pub fn is_published(&self) -> bool {
        self.publish
    }
}

/// Arena-backed object tree.
#[derive(Default)]
pub struct ObjectTree {
    objects: Vec<ObjectNode>,
    roots: Vec<ObjectId>,
}

impl ObjectTree {
    pub fn new() -> ObjectTree {
        ObjectTree::default()
    }

    /// Add a root object. Only roots carry an explicit publish flag; the
    /// subtree under a published root is what BlueZ gets to see.
    pub fn add_root(&mut self, path_node: &str, publish: bool) -> ObjectId {
        let id = self.objects.len();
        self.objects.push(ObjectNode {
            path_node: path_node.trim_matches('/').to_string(),
            parent: None,
            children: Vec::new(),
            interfaces: Vec::new(),
            publish,
        });
        self.roots.push(id);
        id
    }

    /// Add a child object one segment below `parent`.
    pub fn add_child(&mut self, parent: ObjectId, segment: &str) -> Result<ObjectId> {
        if !ObjectPath::is_valid_segment(segment) {
            bail!("'{}' is not a valid object path segment", segment);
        }
        let publish = self.objects[parent].publish;
        let id = self.objects.len();
        self.objects.push(ObjectNode {
            path_node: segment.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            interfaces: Vec::new(),
            publish,
        });
        self.objects[parent].children.push(id);
        Ok(id)
    }

    /// Attach an interface. Names must be unique per object.
    pub fn add_interface(&mut self, object: ObjectId, interface: Interface) -> Result<()> {
        let node = &mut self.objects[object];
        if node.interfaces.iter().any(|i| i.name == interface.name) {
            bail!(
                "object '{}' already has an interface named '{}'",
                node.path_node,
                interface.name
            );
        }
        node.interfaces.push(interface);
        Ok(())
    }

    pub(crate) fn interface_mut(
        &mut self,
        object: ObjectId,
        name: &str,
    ) -> Option<&mut Interface> {
        self.objects[object]
            .interfaces
            .iter_mut()
            .find(|i| i.name == name)
    }

    pub fn node(&self, id: ObjectId) -> &ObjectNode {
        &self.objects[id]
    }

    pub fn roots(&self) -> &[ObjectId] {
        &self.roots
    }

    pub fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.objects[id].parent
    }

    /// Full path of an object: every ancestor's node joined by slashes.
    pub fn full_path(&self, id: ObjectId) -> ObjectPath {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(idx) = current {
            let node = &self.objects[idx];
            if !node.path_node.is_empty() {
                segments.push(node.path_node.as_str());
            }
            current = node.parent;
        }

        let mut path = ObjectPath::root();
        for segment in segments.into_iter().rev() {
            path = path.append(segment);
        }
        path
    }

    /// Locate the object at `path`, searching children in declaration order.
    pub fn find_object(&self, path: &str) -> Option<ObjectId> {
        let wanted = ObjectPath::new(path);
        for &root in &self.roots {
            if let Some(found) = self.find_object_from(root, &wanted) {
                return Some(found);
            }
        }
        None
    }

    fn find_object_from(&self, id: ObjectId, wanted: &ObjectPath) -> Option<ObjectId> {
        if &self.full_path(id) == wanted {
            return Some(id);
        }
        for &child in &self.objects[id].children {
            if let Some(found) = self.find_object_from(child, wanted) {
                return Some(found);
            }
        }
        None
    }

    /// Locate `(object, interface)` by path and interface name.
    pub fn find_interface(&self, path: &str, interface_name: &str) -> Option<(ObjectId, &Interface)> {
        let object = self.find_object(path)?;
        let interface = self.objects[object]
            .interfaces
            .iter()
            .find(|i| i.name == interface_name)?;
        Some((object, interface))
    }

    /// Locate a property by path, interface and property name.
    pub fn find_property(
        &self,
        path: &str,
        interface_name: &str,
        property_name: &str,
    ) -> Option<(ObjectId, &Interface, &GattProperty)> {
        let (object, interface) = self.find_interface(path, interface_name)?;
        let property = interface.find_property(property_name)?;
        Some((object, interface, property))
    }

    /// Build the `GetManagedObjects` snapshot: every object under a
    /// published root that carries at least one interface. Objects without
    /// interfaces are skipped but their children are still visited.
    pub fn managed_objects(&self) -> ManagedObjectsSnapshot {
        let mut snapshot = Vec::new();
        for &root in &self.roots {
            if self.objects[root].publish {
                self.collect_managed(root, &mut snapshot);
            }
        }
        snapshot
    }

    fn collect_managed(&self, id: ObjectId, snapshot: &mut ManagedObjectsSnapshot) {
        let node = &self.objects[id];
        if !node.publish {
            return;
        }

        if !node.interfaces.is_empty() {
            let mut interfaces = Vec::new();
            for interface in &node.interfaces {
                if interface.properties.is_empty() {
                    continue;
                }
                let properties = interface
                    .properties
                    .iter()
                    .map(|p| (p.name.clone(), p.value.clone()))
                    .collect();
                interfaces.push((interface.name.clone(), properties));
            }
            snapshot.push((self.full_path(id), interfaces));
        }

        for &child in &node.children {
            self.collect_managed(child, snapshot);
        }
    }

    /// Tick every published object's tick events (periodic timer entry).
    pub fn tick_events(&self, data: &ServerData, notifier: &dyn ChangeNotifier) {
        for &root in &self.roots {
            if self.objects[root].publish {
                self.tick_object(root, data, notifier);
            }
        }
    }

    fn tick_object(&self, id: ObjectId, data: &ServerData, notifier: &dyn ChangeNotifier) {
        for interface in &self.objects[id].interfaces {
            for event in &interface.tick_events {
                let ctx = InterfaceContext {
                    tree: self,
                    object: id,
                    interface,
                    data,
                    notifier,
                    args: None,
                };
                event.tick(&ctx);
            }
        }
        for &child in &self.objects[id].children {
            self.tick_object(child, data, notifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn service_interface(uuid: &str) -> Interface {
        let mut iface = Interface::new("org.bluez.GattService1", InterfaceKind::Service);
        iface
            .properties
            .push(GattProperty::fixed("UUID", DataValue::Text(uuid.into())));
        iface
            .properties
            .push(GattProperty::fixed("Primary", DataValue::Boolean(true)));
        iface
    }

    #[test]
    fn test_full_paths_join_ancestor_segments() {
        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/demo", true);
        let service = tree.add_child(root, "device").unwrap();
        let chr = tree.add_child(service, "mfgr_name").unwrap();

        assert_eq!(tree.full_path(root).as_str(), "/com/demo");
        assert_eq!(tree.full_path(service).as_str(), "/com/demo/device");
        assert_eq!(tree.full_path(chr).as_str(), "/com/demo/device/mfgr_name");
    }

    #[test]
    fn test_empty_root_is_slash() {
        let mut tree = ObjectTree::new();
        let om_root = tree.add_root("", false);
        assert_eq!(tree.full_path(om_root).as_str(), "/");
    }

    #[test]
    fn test_duplicate_interface_names_rejected() {
        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/demo", true);
        tree.add_interface(root, service_interface("180A")).unwrap();
        assert!(tree.add_interface(root, service_interface("180F")).is_err());
    }

    #[test]
    fn test_invalid_segment_rejected() {
        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/demo", true);
        assert!(tree.add_child(root, "bad segment").is_err());
        assert!(tree.add_child(root, "").is_err());
    }

    #[test]
    fn test_find_interface_walks_declaration_order() {
        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/demo", true);
        let a = tree.add_child(root, "device").unwrap();
        tree.add_interface(a, service_interface("180A")).unwrap();

        let (object, iface) = tree
            .find_interface("/com/demo/device", "org.bluez.GattService1")
            .unwrap();
        assert_eq!(object, a);
        assert_eq!(iface.kind, InterfaceKind::Service);

        assert!(tree.find_interface("/com/demo/nope", "org.bluez.GattService1").is_none());
        assert!(tree.find_interface("/com/demo/device", "org.bluez.Nope").is_none());
    }

    #[test]
    fn test_managed_objects_skips_unpublished_and_empty() {
        let mut tree = ObjectTree::new();

        let om_root = tree.add_root("", false);
        let mut om = Interface::new("org.freedesktop.DBus.ObjectManager", InterfaceKind::Plain);
        om.methods.push(Method {
            name: "GetManagedObjects".into(),
            in_args: vec![],
            out_args: Some("a{oa{sa{sv}}}".into()),
            handler: Arc::new(|ctx| Ok(MethodReply::ManagedObjects(ctx.tree.managed_objects()))),
        });
        tree.add_interface(om_root, om).unwrap();

        let root = tree.add_root("com/demo", true);
        let service = tree.add_child(root, "device").unwrap();
        tree.add_interface(service, service_interface("180A")).unwrap();

        let snapshot = tree.managed_objects();
        let paths: Vec<&str> = snapshot.iter().map(|(p, _)| p.as_str()).collect();

        // The object-manager root is infrastructure; the publish root has no
        // interfaces of its own but its child service shows up.
        assert_eq!(paths, vec!["/com/demo/device"]);

        let (_, interfaces) = &snapshot[0];
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].0, "org.bluez.GattService1");
        let props = &interfaces[0].1;
        assert!(props.iter().any(|(n, v)| n == "UUID" && *v == DataValue::Text("180A".into())));
    }

    #[test]
    fn test_tick_event_fires_at_frequency() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/demo", true);
        let mut iface = service_interface("1805");
        iface.tick_events.push(TickEvent::new(
            3,
            Arc::new(move |_ctx| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        tree.add_interface(root, iface).unwrap();

        let data = ServerData::empty();
        for _ in 0..7 {
            tree.tick_events(&data, &NullNotifier);
        }
        // Fires on ticks 3 and 6.
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unpublished_roots_do_not_tick() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let mut tree = ObjectTree::new();
        let root = tree.add_root("", false);
        let mut iface = Interface::new("org.freedesktop.DBus.ObjectManager", InterfaceKind::Plain);
        iface.tick_events.push(TickEvent::new(
            1,
            Arc::new(move |_ctx| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        tree.add_interface(root, iface).unwrap();

        tree.tick_events(&ServerData::empty(), &NullNotifier);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
