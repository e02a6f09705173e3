//! Introspection XML for the published object hierarchy.

use crate::gatt::{Interface, ObjectId, ObjectTree};

const XML_HEADER: &str = "<?xml version='1.0'?>\n<!DOCTYPE node PUBLIC '-//freedesktop//DTD D-BUS Object Introspection 1.0//EN' 'http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd'>\n";

/// Render the introspection document for `object` and its subtree.
///
/// `service_name` feeds the path annotation each node carries, which makes
/// bus-side debugging of deep hierarchies considerably less painful.
pub fn introspection_xml(tree: &ObjectTree, service_name: &str, object: ObjectId) -> String {
    let mut xml = String::from(XML_HEADER);
    render_node(tree, service_name, object, 0, &mut xml);
    xml
}

fn render_node(
    tree: &ObjectTree,
    service_name: &str,
    object: ObjectId,
    depth: usize,
    xml: &mut String,
) {
    let prefix = "  ".repeat(depth);
    let node = tree.node(object);

    xml.push_str(&format!("{}<node name='{}'>\n", prefix, node.path_node()));
    xml.push_str(&format!(
        "{}  <annotation name='{}.DBusObject.path' value='{}' />\n",
        prefix,
        service_name,
        tree.full_path(object)
    ));

    for interface in node.interfaces() {
        render_interface(interface, depth + 1, xml);
    }

    for &child in node.children() {
        render_node(tree, service_name, child, depth + 1, xml);
    }

    xml.push_str(&format!("{}</node>\n", prefix));
}

fn render_interface(interface: &Interface, depth: usize, xml: &mut String) {
    let prefix = "  ".repeat(depth);

    if interface.methods.is_empty() && interface.properties.is_empty() {
        xml.push_str(&format!("{}<interface name='{}' />\n", prefix, interface.name));
        return;
    }

    xml.push_str(&format!("{}<interface name='{}'>\n", prefix, interface.name));

    for method in &interface.methods {
        if method.in_args.is_empty() && method.out_args.is_none() {
            xml.push_str(&format!("{}  <method name='{}' />\n", prefix, method.name));
            continue;
        }
        xml.push_str(&format!("{}  <method name='{}'>\n", prefix, method.name));
        for arg in &method.in_args {
            xml.push_str(&format!(
                "{}    <arg type='{}' direction='in' />\n",
                prefix, arg
            ));
        }
        if let Some(out) = &method.out_args {
            xml.push_str(&format!(
                "{}    <arg type='{}' direction='out' />\n",
                prefix, out
            ));
        }
        xml.push_str(&format!("{}  </method>\n", prefix));
    }

    for property in &interface.properties {
        let access = if property.setter.is_some() {
            "readwrite"
        } else {
            "read"
        };
        xml.push_str(&format!(
            "{}  <property name='{}' type='{}' access='{}' />\n",
            prefix,
            property.name,
            property.value.signature(),
            access
        ));
    }

    xml.push_str(&format!("{}</interface>\n", prefix));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ServerBuilder;

    fn demo_xml() -> String {
        let description = ServerBuilder::new("demo", "", "")
            .service("device", "180A", |service| {
                service.characteristic("mfgr", "2A29", &["read"], |chr| {
                    chr.on_read(|_ctx| Ok(b"Acme Inc.".to_vec()));
                });
            })
            .build()
            .unwrap();

        let tree = description.tree();
        let root = tree.find_object("/com/demo").unwrap();
        introspection_xml(tree, "demo", root)
    }

    #[test]
    fn test_document_header_present() {
        let xml = demo_xml();
        assert!(xml.starts_with("<?xml version='1.0'?>"));
        assert!(xml.contains("<!DOCTYPE node PUBLIC"));
    }

    #[test]
    fn test_nodes_nest_and_carry_path_annotations() {
        let xml = demo_xml();
        assert!(xml.contains("<node name='com/demo'>"));
        assert!(xml.contains("<node name='device'>"));
        assert!(xml.contains("<node name='mfgr'>"));
        assert!(xml.contains("value='/com/demo/device/mfgr'"));
    }

    #[test]
    fn test_methods_list_their_arguments() {
        let xml = demo_xml();
        assert!(xml.contains("<method name='ReadValue'>"));
        assert!(xml.contains("<arg type='a{sv}' direction='in' />"));
        assert!(xml.contains("<arg type='ay' direction='out' />"));
    }

    #[test]
    fn test_properties_carry_type_and_access() {
        let xml = demo_xml();
        assert!(xml.contains("<property name='UUID' type='s' access='read' />"));
        assert!(xml.contains("<property name='Primary' type='b' access='read' />"));
        assert!(xml.contains("<property name='Flags' type='as' access='read' />"));
        assert!(xml.contains("<property name='Service' type='o' access='read' />"));
    }

    #[test]
    fn test_empty_interface_collapses_to_self_closing_tag() {
        use crate::gatt::{Interface, InterfaceKind, ObjectTree};

        let mut tree = ObjectTree::new();
        let root = tree.add_root("com/x", true);
        tree.add_interface(root, Interface::new("com.x.Empty", InterfaceKind::Plain))
            .unwrap();

        let xml = introspection_xml(&tree, "x", root);
        assert!(xml.contains("<interface name='com.x.Empty' />"));
    }
}
