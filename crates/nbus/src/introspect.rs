//! Introspection XML
//!
//! Generation walks a node's descriptors and children into the freedesktop
//! introspection document; parsing turns a remote document back into
//! descriptors for the proxy pass. Schema validation is out of scope: the
//! parser takes what it recognizes and ignores annotations.

use crate::descriptor::{InterfaceDescriptor, PropertyAccess};
use crate::error::{BusError, Result};
use crate::object::ObjectNode;
use crate::standard;
use serde::Deserialize;

pub(crate) const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object \
Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Render the introspection document for a server-side node.
pub(crate) fn node_xml(node: &ObjectNode) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(DOCTYPE);
    out.push_str("<node>\n");
    for desc in standard::standard_descriptors(node.is_object_manager()) {
        interface_xml(&desc, &mut out);
    }
    for iface in node.interfaces() {
        interface_xml(iface.descriptor(), &mut out);
    }
    for name in node.child_names() {
        out.push_str(&format!("  <node name=\"{name}\"/>\n"));
    }
    out.push_str("</node>\n");
    out
}

fn interface_xml(desc: &InterfaceDescriptor, out: &mut String) {
    out.push_str(&format!("  <interface name=\"{}\">\n", desc.name()));
    for method in desc.methods() {
        out.push_str(&format!("    <method name=\"{}\">\n", method.name));
        for node in &method.inputs.types {
            out.push_str(&format!("      <arg type=\"{node}\" direction=\"in\"/>\n"));
        }
        for node in &method.outputs.types {
            out.push_str(&format!("      <arg type=\"{node}\" direction=\"out\"/>\n"));
        }
        out.push_str("    </method>\n");
    }
    for property in desc.properties() {
        out.push_str(&format!(
            "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
            property.name,
            property.node,
            property.access.as_str()
        ));
    }
    for signal in desc.signals() {
        out.push_str(&format!("    <signal name=\"{}\">\n", signal.name));
        for node in &signal.args.types {
            out.push_str(&format!("      <arg type=\"{node}\"/>\n"));
        }
        out.push_str("    </signal>\n");
    }
    out.push_str("  </interface>\n");
}

#[derive(Debug, Deserialize)]
struct XmlArg {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum XmlMethodElement {
    Arg(XmlArg),
    Annotation(XmlAnnotation),
}

#[derive(Debug, Deserialize)]
struct XmlAnnotation {
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlMethod {
    name: String,
    #[serde(rename = "$value", default)]
    elems: Vec<XmlMethodElement>,
}

#[derive(Debug, Deserialize)]
struct XmlSignal {
    name: String,
    #[serde(rename = "$value", default)]
    elems: Vec<XmlMethodElement>,
}

#[derive(Debug, Deserialize)]
struct XmlProperty {
    name: String,
    #[serde(rename = "type")]
    typ: String,
    access: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum XmlInterfaceElement {
    Method(XmlMethod),
    Signal(XmlSignal),
    Property(XmlProperty),
    Annotation(XmlAnnotation),
}

#[derive(Debug, Deserialize)]
struct XmlInterface {
    name: String,
    #[serde(rename = "$value", default)]
    elems: Vec<XmlInterfaceElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum XmlNodeElement {
    Node(XmlNode),
    Interface(XmlInterface),
}

#[derive(Debug, Deserialize)]
struct XmlNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "$value", default)]
    elems: Vec<XmlNodeElement>,
}

/// What the proxy pass needs from one introspection document.
#[derive(Debug, Default)]
pub(crate) struct Introspection {
    pub interfaces: Vec<InterfaceDescriptor>,
    pub children: Vec<String>,
}

/// Parse an introspection document.
pub(crate) fn parse(xml: &str) -> Result<Introspection> {
    // The doctype header is boilerplate the XML reader has no use for.
    let body = match xml.find("<node") {
        Some(idx) => &xml[idx..],
        None => xml,
    };
    let node: XmlNode = serde_xml_rs::from_str(body)
        .map_err(|e| BusError::InvalidReply(format!("introspection XML: {e}")))?;

    let mut out = Introspection::default();
    for elem in node.elems {
        match elem {
            XmlNodeElement::Node(child) => {
                if let Some(name) = child.name {
                    out.children.push(name);
                }
            }
            XmlNodeElement::Interface(iface) => {
                out.interfaces.push(convert_interface(iface)?);
            }
        }
    }
    Ok(out)
}

fn convert_interface(iface: XmlInterface) -> Result<InterfaceDescriptor> {
    let mut desc = InterfaceDescriptor::new(&iface.name)?;
    for elem in iface.elems {
        match elem {
            XmlInterfaceElement::Method(method) => {
                let mut inputs = String::new();
                let mut outputs = String::new();
                for e in method.elems {
                    if let XmlMethodElement::Arg(arg) = e {
                        // Direction defaults to "in" for methods.
                        if arg.direction.as_deref() == Some("out") {
                            outputs.push_str(&arg.typ);
                        } else {
                            inputs.push_str(&arg.typ);
                        }
                    }
                }
                desc.add_method(&method.name, &inputs, &outputs)?;
            }
            XmlInterfaceElement::Signal(signal) => {
                let mut args = String::new();
                for e in signal.elems {
                    if let XmlMethodElement::Arg(arg) = e {
                        args.push_str(&arg.typ);
                    }
                }
                desc.add_signal(&signal.name, &args)?;
            }
            XmlInterfaceElement::Property(property) => {
                let access = PropertyAccess::from_str(&property.access).ok_or_else(|| {
                    BusError::InvalidReply(format!(
                        "property {} has access {:?}",
                        property.name, property.access
                    ))
                })?;
                desc.add_property(&property.name, &property.typ, access)?;
            }
            XmlInterfaceElement::Annotation(_) => {}
        }
    }
    Ok(desc)
}
