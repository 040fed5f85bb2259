//! The standard interfaces
//!
//! `Peer`, `Introspectable` and `Properties` are answered by this shim for
//! every node of every exposed service; `ObjectManager` is answered where a
//! node has opted in. The shim runs before user interface lookup in the
//! dispatch path, so these members can never be shadowed.

use crate::descriptor::InterfaceDescriptor;
use crate::error::{BusError, Result};
use crate::object::ObjectNode;
use crate::router::Router;
use crate::service::Service;
use nbus_proto::bridge::{body_to_values, values_to_body};
use nbus_proto::{Dict, Message, Signature, SignatureTree, TypeNode, Value, Variant, WireValue};
use std::sync::Arc;
use tracing::debug;

pub const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

pub fn is_standard_interface(name: &str) -> bool {
    matches!(
        name,
        PEER_IFACE | INTROSPECTABLE_IFACE | PROPERTIES_IFACE | OBJECT_MANAGER_IFACE
    )
}

fn tree(signature: &str) -> SignatureTree {
    SignatureTree::parse(signature).expect("constant signature")
}

/// Serve one standard-interface call against `node`, replying on the
/// router. Unknown members get `UnknownMethod`; every failure becomes an
/// error reply, never a dropped call.
pub(crate) async fn dispatch(
    router: &Arc<Router>,
    _service: &Arc<Service>,
    node: &Arc<ObjectNode>,
    msg: &Message,
) {
    let interface = msg.interface.as_deref().unwrap_or_default();
    let member = msg.member.as_deref().unwrap_or_default();
    let result = match (interface, member) {
        (PEER_IFACE, "Ping") => Ok((Signature::empty(), Vec::new())),
        (PEER_IFACE, "GetMachineId") => reply_string(router.machine_id()),
        (INTROSPECTABLE_IFACE, "Introspect") => reply_string(node.introspect()),
        (PROPERTIES_IFACE, "Get") => properties_get(node, msg),
        (PROPERTIES_IFACE, "GetAll") => properties_get_all(node, msg),
        (PROPERTIES_IFACE, "Set") => properties_set(node, msg),
        (OBJECT_MANAGER_IFACE, _) if !node.is_object_manager() => {
            Err(BusError::UnknownInterface(interface.to_owned()))
        }
        (OBJECT_MANAGER_IFACE, "GetManagedObjects") => managed_objects(node),
        _ => Err(BusError::UnknownMethod(member.to_owned())),
    };
    match result {
        Ok((signature, body)) => {
            let _ = router.send_reply(msg, signature, body);
        }
        Err(e) => {
            let _ = router.send_error_of(msg, &e);
        }
    }
}

fn reply_string(s: String) -> Result<(Signature, Vec<WireValue>)> {
    Ok((
        Signature::new("s").expect("constant signature"),
        vec![WireValue::Str(s)],
    ))
}

fn two_strings(msg: &Message) -> Result<(String, String)> {
    let values = body_to_values(&msg.body, &tree("ss")).map_err(BusError::from)?;
    let [Value::Str(a), Value::Str(b)] = values.as_slice() else {
        return Err(BusError::InvalidReply("expected two strings".into()));
    };
    Ok((a.clone(), b.clone()))
}

fn properties_get(node: &Arc<ObjectNode>, msg: &Message) -> Result<(Signature, Vec<WireValue>)> {
    let (iface_name, prop) = two_strings(msg)?;
    let iface = node
        .interface(&iface_name)
        .ok_or_else(|| BusError::UnknownInterface(iface_name.clone()))?;
    let (type_node, value) = iface.get_for_bus(&prop)?;
    let body = values_to_body(
        &[Value::Variant(Box::new(Variant::new(type_node, value)))],
        &tree("v"),
    )
    .map_err(BusError::from)?;
    Ok((Signature::new("v").expect("constant signature"), body))
}

fn properties_get_all(
    node: &Arc<ObjectNode>,
    msg: &Message,
) -> Result<(Signature, Vec<WireValue>)> {
    let values = body_to_values(&msg.body, &tree("s")).map_err(BusError::from)?;
    let Some(Value::Str(iface_name)) = values.into_iter().next() else {
        return Err(BusError::InvalidReply("expected an interface name".into()));
    };
    let iface = node
        .interface(&iface_name)
        .ok_or_else(|| BusError::UnknownInterface(iface_name.clone()))?;
    // Write-only properties are omitted, not errored.
    let mut dict = Dict::new();
    for (name, type_node, value) in iface.readable_properties() {
        dict.insert(
            Value::Str(name),
            Value::Variant(Box::new(Variant::new(type_node, value))),
        );
    }
    let body =
        values_to_body(&[Value::Dict(dict)], &tree("a{sv}")).map_err(BusError::from)?;
    Ok((Signature::new("a{sv}").expect("constant signature"), body))
}

fn properties_set(node: &Arc<ObjectNode>, msg: &Message) -> Result<(Signature, Vec<WireValue>)> {
    let values = body_to_values(&msg.body, &tree("ssv")).map_err(BusError::from)?;
    let [Value::Str(iface_name), Value::Str(prop), value] = values.as_slice() else {
        return Err(BusError::InvalidReply(
            "expected interface, property and value".into(),
        ));
    };
    let iface = node
        .interface(iface_name)
        .ok_or_else(|| BusError::UnknownInterface(iface_name.clone()))?;
    iface.set_from_bus(prop, value.clone())?;
    Ok((Signature::empty(), Vec::new()))
}

fn managed_objects(node: &Arc<ObjectNode>) -> Result<(Signature, Vec<WireValue>)> {
    let payload = node.managed_objects();
    let body = values_to_body(&[payload], &tree("a{oa{sa{sv}}}")).map_err(BusError::from)?;
    Ok((
        Signature::new("a{oa{sa{sv}}}").expect("constant signature"),
        body,
    ))
}

/// Wire body of a `PropertiesChanged` signal.
pub(crate) fn properties_changed_body(
    interface: &str,
    changed: &[(String, TypeNode, Value)],
    invalidated: &[String],
) -> (Signature, Vec<WireValue>) {
    let mut dict = Dict::new();
    for (name, node, value) in changed {
        dict.insert(
            Value::Str(name.clone()),
            Value::Variant(Box::new(Variant::new(node.clone(), value.clone()))),
        );
    }
    let invalidated = Value::Array(
        invalidated
            .iter()
            .map(|name| Value::Str(name.clone()))
            .collect::<Vec<_>>(),
    );
    // An empty invalidated list still travels as `as`.
    let body = match values_to_body(
        &[
            Value::Str(interface.to_owned()),
            Value::Dict(dict),
            invalidated,
        ],
        &tree("sa{sv}as"),
    ) {
        Ok(body) => body,
        Err(_) => vec![
            WireValue::Str(interface.to_owned()),
            WireValue::Seq(Vec::new()),
            WireValue::Seq(Vec::new()),
        ],
    };
    (
        Signature::new("sa{sv}as").expect("constant signature"),
        body,
    )
}

/// Emit `InterfacesAdded` from a manager node.
pub(crate) fn emit_interfaces_added(
    router: &Arc<Router>,
    manager_path: &str,
    object_path: &str,
    payload: Value,
) {
    let body = match values_to_body(
        &[Value::ObjectPath(object_path.to_owned()), payload],
        &tree("oa{sa{sv}}"),
    ) {
        Ok(body) => body,
        Err(e) => {
            debug!(path = object_path, error = %e, "InterfacesAdded payload rejected");
            return;
        }
    };
    let _ = router.send_signal(
        manager_path,
        OBJECT_MANAGER_IFACE,
        "InterfacesAdded",
        Signature::new("oa{sa{sv}}").expect("constant signature"),
        body,
    );
}

/// Emit `InterfacesRemoved` from a manager node.
pub(crate) fn emit_interfaces_removed(
    router: &Arc<Router>,
    manager_path: &str,
    object_path: &str,
    interfaces: Vec<String>,
) {
    let names = Value::Array(interfaces.into_iter().map(Value::Str).collect::<Vec<_>>());
    let body = match values_to_body(
        &[Value::ObjectPath(object_path.to_owned()), names],
        &tree("oas"),
    ) {
        Ok(body) => body,
        Err(_) => vec![
            WireValue::Path(object_path.to_owned()),
            WireValue::Seq(Vec::new()),
        ],
    };
    let _ = router.send_signal(
        manager_path,
        OBJECT_MANAGER_IFACE,
        "InterfacesRemoved",
        Signature::new("oas").expect("constant signature"),
        body,
    );
}

/// Descriptors of the standard interfaces, for introspection XML.
pub(crate) fn standard_descriptors(object_manager: bool) -> Vec<InterfaceDescriptor> {
    let mut peer = InterfaceDescriptor::new(PEER_IFACE).expect("constant name");
    peer.add_method("Ping", "", "").expect("constant member");
    peer.add_method("GetMachineId", "", "s")
        .expect("constant member");

    let mut introspectable =
        InterfaceDescriptor::new(INTROSPECTABLE_IFACE).expect("constant name");
    introspectable
        .add_method("Introspect", "", "s")
        .expect("constant member");

    let mut properties = InterfaceDescriptor::new(PROPERTIES_IFACE).expect("constant name");
    properties.add_method("Get", "ss", "v").expect("constant member");
    properties
        .add_method("GetAll", "s", "a{sv}")
        .expect("constant member");
    properties
        .add_method("Set", "ssv", "")
        .expect("constant member");
    properties
        .add_signal("PropertiesChanged", "sa{sv}as")
        .expect("constant member");

    let mut out = vec![peer, introspectable, properties];
    if object_manager {
        let mut manager = InterfaceDescriptor::new(OBJECT_MANAGER_IFACE).expect("constant name");
        manager
            .add_method("GetManagedObjects", "", "a{oa{sa{sv}}}")
            .expect("constant member");
        manager
            .add_signal("InterfacesAdded", "oa{sa{sv}}")
            .expect("constant member");
        manager
            .add_signal("InterfacesRemoved", "oas")
            .expect("constant member");
        out.push(manager);
    }
    out
}
