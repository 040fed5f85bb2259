//! Shared fixtures for the integration suites: an embedded broker plus the
//! example services the scenarios exercise.

#![allow(dead_code)]

use nbus::{
    Broker, Bus, BusError, Interface, ObjectNode, PropertyAccess, Result, Service, Value,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIMPLE_NAME: &str = "com.example.SimpleService";
pub const PHONEBOOK_NAME: &str = "com.example.PhoneBook";
pub const PHONEBOOK_PATH: &str = "/com/example/PhoneBook";
pub const CONTACT_IFACE: &str = "com.example.PhoneBook.Contact";

/// Bound every await in the suites so a regression fails instead of
/// hanging.
pub async fn within<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test step timed out")
}

/// Route `RUST_LOG`-filtered tracing to the test output. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn connect(broker: &Broker) -> Arc<Bus> {
    init_tracing();
    Bus::connect(broker.connect()).await.expect("bus connects")
}

/// `com.example.SimpleService`: one greeting method, one u16 property and
/// a greeting signal at the root object.
pub fn simple_service() -> Arc<Service> {
    let iface = Interface::builder(SIMPLE_NAME)
        .unwrap()
        .method("SayHello", "s", "s", |cx| async move {
            let who = cx.args[0].as_str().unwrap_or_default().to_owned();
            let text = if who.is_empty() {
                "Hello, world!".to_owned()
            } else {
                format!("Hello, {who}!")
            };
            if !who.is_empty() {
                cx.interface.emit_signal("Greeted", vec![who.into()])?;
            }
            Ok(vec![text.into()])
        })
        .unwrap()
        .property(
            "ExampleProperty",
            "q",
            PropertyAccess::ReadWrite,
            Value::UInt16(1089),
        )
        .unwrap()
        .signal("Greeted", "s")
        .unwrap()
        .build()
        .unwrap();
    let service = Service::new();
    service.root().add_interface(iface).unwrap();
    service
}

/// `com.example.PhoneBook` under `/com/example/PhoneBook`, managing
/// contact objects below it and announcing them via `ObjectManager`.
pub fn phonebook_service() -> Arc<Service> {
    let next_id = Arc::new(AtomicU32::new(1));
    let ids = next_id.clone();
    let iface = Interface::builder(PHONEBOOK_NAME)
        .unwrap()
        .method("AddContact", "ssq", "o", move |cx| {
            let ids = ids.clone();
            async move {
                let name = cx.args[0].as_str().unwrap_or_default().to_owned();
                let phone = cx.args[1].as_str().unwrap_or_default().to_owned();
                let age = cx.args[2].as_u16().unwrap_or_default();
                let parent = cx.interface.node().ok_or(BusError::NotExposed)?;

                let contact = ObjectNode::new();
                let contact_iface = Interface::builder(CONTACT_IFACE)?
                    .property("Name", "s", PropertyAccess::Read, name.clone().into())?
                    .property("Phone", "s", PropertyAccess::Read, phone.into())?
                    .property("Age", "q", PropertyAccess::Read, Value::UInt16(age))?
                    .build()?;
                contact.add_interface(contact_iface)?;

                let id = ids.fetch_add(1, Ordering::SeqCst);
                parent.add_object(&format!("Contacts/{id}"), contact.clone())?;
                let path = contact.path();

                let contacts = cx.interface.container_cell("Contacts")?;
                contacts.push(Value::Struct(vec![
                    Value::ObjectPath(path.clone()),
                    name.into(),
                ]))?;
                cx.interface
                    .set_property("NbContacts", Value::UInt16(contacts.len() as u16))?;
                Ok(vec![Value::ObjectPath(path)])
            }
        })
        .unwrap()
        .method("DeleteContacts", "ao", "", |cx| async move {
            let doomed: Vec<String> = cx.args[0]
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(|p| p.as_str().map(str::to_owned))
                .collect();
            let parent = cx.interface.node().ok_or(BusError::NotExposed)?;
            let base = format!("{}/", parent.path());
            let contacts = cx.interface.container_cell("Contacts")?;
            for path in doomed {
                let relative = path
                    .strip_prefix(&base)
                    .ok_or_else(|| BusError::UnknownObject(path.clone()))?;
                parent.remove_object(relative)?;
                contacts.remove_where(|entry| {
                    matches!(entry, Value::Struct(fields)
                        if fields.first() == Some(&Value::ObjectPath(path.clone())))
                })?;
            }
            cx.interface
                .set_property("NbContacts", Value::UInt16(contacts.len() as u16))?;
            Ok(Vec::new())
        })
        .unwrap()
        .property("NbContacts", "q", PropertyAccess::Read, Value::UInt16(0))
        .unwrap()
        .property("Contacts", "a(os)", PropertyAccess::Read, Value::Array(Vec::new()))
        .unwrap()
        .build()
        .unwrap();

    let node = ObjectNode::new();
    node.enable_object_manager();
    node.add_interface(iface).unwrap();
    let service = Service::new();
    service
        .root()
        .add_object("com/example/PhoneBook", node)
        .unwrap();
    service
}

/// An interface returning one fixed value per D-Bus type, plus one
/// multi-output method.
pub fn types_service() -> Arc<Service> {
    fn constant(
        builder: nbus::InterfaceBuilder,
        name: &str,
        signature: &str,
        value: Value,
    ) -> Result<nbus::InterfaceBuilder> {
        builder.method(name, "", signature, move |_| {
            let value = value.clone();
            async move { Ok(vec![value]) }
        })
    }

    let builder = Interface::builder("com.example.TypesOverview").unwrap();
    let builder = constant(builder, "GetUint16", "q", Value::UInt16(54827)).unwrap();
    let builder = constant(builder, "GetInt16", "n", Value::Int16(-29786)).unwrap();
    let builder = constant(builder, "GetUint32", "u", Value::UInt32(3_728_666_323)).unwrap();
    let builder = constant(builder, "GetInt32", "i", Value::Int32(-1_829_732_118)).unwrap();
    let builder = constant(builder, "GetDouble", "d", Value::Double(129_387.978_674_2)).unwrap();
    let builder = constant(builder, "GetBool", "b", Value::Bool(false)).unwrap();
    let builder = constant(
        builder,
        "GetObjectPath",
        "o",
        Value::ObjectPath("/path/to/some/dbus/object".into()),
    )
    .unwrap();
    let builder = constant(
        builder,
        "GetStringArray",
        "as",
        Value::Array(vec![
            "foo".into(),
            "bar".into(),
            "quux".into(),
            "hello, world!".into(),
        ]),
    )
    .unwrap();
    let builder = constant(
        builder,
        "GetStruct",
        "(bds)",
        Value::Struct(vec![
            true.into(),
            42.1089f64.into(),
            "Just a string...".into(),
        ]),
    )
    .unwrap();
    let builder = builder
        .method("GetMultiple", "", "sbi", |_| async move {
            Ok(vec![
                "String as argument #1".into(),
                false.into(),
                Value::Int32(-52_395_872),
            ])
        })
        .unwrap();

    let service = Service::new();
    service.root().add_interface(builder.build().unwrap()).unwrap();
    service
}
