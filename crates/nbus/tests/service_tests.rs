//! Server-side scenarios over the embedded broker: method dispatch,
//! property access, object-tree surgery and ObjectManager announcements,
//! all observed from a second bus connection speaking raw messages.

mod common;

use common::*;
use nbus::proto::bridge::body_to_values;
use nbus::router::SignalHandler;
use nbus::{
    standard, Broker, BusError, Interface, Message, PropertyAccess, SignatureTree, Value,
};
use nbus::proto::MatchRule;
use std::sync::Arc;
use tokio::sync::mpsc;

async fn call(
    bus: &Arc<nbus::Bus>,
    destination: &str,
    path: &str,
    interface: &str,
    member: &str,
    signature: &str,
    args: &[Value],
) -> nbus::Result<Vec<Value>> {
    let tree = SignatureTree::parse(signature).unwrap();
    let body = nbus::proto::bridge::values_to_body(args, &tree).unwrap();
    let msg = Message::method_call(destination, path, interface, member)
        .with_body(tree.signature(), body);
    bus.router().call(msg, true).await?.into_values()
}

/// Subscribe to one signal key, funnelling translated bodies into a
/// channel.
async fn subscribe(
    bus: &Arc<nbus::Bus>,
    path: &str,
    interface: &str,
    member: &str,
    signature: &str,
) -> mpsc::UnboundedReceiver<Vec<Value>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let tree = SignatureTree::parse(signature).unwrap();
    let handler: SignalHandler = Arc::new(move |msg| {
        let tx = tx.clone();
        let tree = tree.clone();
        Box::pin(async move {
            if let Ok(values) = body_to_values(&msg.body, &tree) {
                let _ = tx.send(values);
            }
        })
    });
    let rule = MatchRule::signal(path, interface, member);
    let key = (path.to_owned(), interface.to_owned(), member.to_owned());
    bus.router().add_match(&rule, key, handler).await.unwrap();
    rx
}

#[tokio::test]
async fn say_hello_greets_by_name() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();
    let client = connect(&broker).await;

    let reply = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        SIMPLE_NAME,
        "SayHello",
        "s",
        &["".into()],
    ))
    .await
    .unwrap();
    assert_eq!(reply, vec![Value::from("Hello, world!")]);

    let reply = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        SIMPLE_NAME,
        "SayHello",
        "s",
        &["Alice".into()],
    ))
    .await
    .unwrap();
    assert_eq!(reply, vec![Value::from("Hello, Alice!")]);
}

#[tokio::test]
async fn property_round_trip_emits_exactly_one_change() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();
    let client = connect(&broker).await;

    let mut changes = subscribe(
        &client,
        "/",
        standard::PROPERTIES_IFACE,
        "PropertiesChanged",
        "sa{sv}as",
    )
    .await;

    let reply = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        standard::PROPERTIES_IFACE,
        "Get",
        "ss",
        &[SIMPLE_NAME.into(), "ExampleProperty".into()],
    ))
    .await
    .unwrap();
    let variant = reply[0].as_variant().unwrap();
    assert_eq!(variant.value, Value::UInt16(1089));

    within(call(
        &client,
        SIMPLE_NAME,
        "/",
        standard::PROPERTIES_IFACE,
        "Set",
        "ssv",
        &[
            SIMPLE_NAME.into(),
            "ExampleProperty".into(),
            Value::UInt16(42),
        ],
    ))
    .await
    .unwrap();

    let change = within(changes.recv()).await.unwrap();
    assert_eq!(change[0], Value::from(SIMPLE_NAME));
    let changed = change[1].as_dict().unwrap();
    let entry = changed.get(&"ExampleProperty".into()).unwrap();
    assert_eq!(entry.as_variant().unwrap().value, Value::UInt16(42));

    let reply = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        standard::PROPERTIES_IFACE,
        "Get",
        "ss",
        &[SIMPLE_NAME.into(), "ExampleProperty".into()],
    ))
    .await
    .unwrap();
    assert_eq!(reply[0].as_variant().unwrap().value, Value::UInt16(42));

    // Exactly one signal for the one write.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn routing_failures_map_to_standard_errors() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();
    let client = connect(&broker).await;

    let err = within(call(
        &client,
        SIMPLE_NAME,
        "/no/such/object",
        SIMPLE_NAME,
        "SayHello",
        "s",
        &["".into()],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::UnknownObject(_)));

    let err = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        "com.example.Missing",
        "SayHello",
        "s",
        &["".into()],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::UnknownInterface(_)));

    let err = within(call(
        &client,
        SIMPLE_NAME,
        "/",
        SIMPLE_NAME,
        "NoSuchMethod",
        "",
        &[],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::UnknownMethod(_)));
}

#[tokio::test]
async fn property_access_rules_are_enforced() {
    let iface = Interface::builder("com.example.Guarded")
        .unwrap()
        .property("Secret", "s", PropertyAccess::Write, Value::from("hidden"))
        .unwrap()
        .property("Fixed", "q", PropertyAccess::Read, Value::UInt16(7))
        .unwrap()
        .build()
        .unwrap();
    let service = nbus::Service::new();
    service.root().add_interface(iface).unwrap();

    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose("com.example.Guarded", &service).await.unwrap();
    let client = connect(&broker).await;

    let err = within(call(
        &client,
        "com.example.Guarded",
        "/",
        standard::PROPERTIES_IFACE,
        "Get",
        "ss",
        &["com.example.Guarded".into(), "Secret".into()],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::PropertyWriteOnly { .. }));

    let err = within(call(
        &client,
        "com.example.Guarded",
        "/",
        standard::PROPERTIES_IFACE,
        "Set",
        "ssv",
        &[
            "com.example.Guarded".into(),
            "Fixed".into(),
            Value::UInt16(8),
        ],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::PropertyReadOnly { .. }));

    // GetAll silently omits the write-only property.
    let reply = within(call(
        &client,
        "com.example.Guarded",
        "/",
        standard::PROPERTIES_IFACE,
        "GetAll",
        "s",
        &["com.example.Guarded".into()],
    ))
    .await
    .unwrap();
    let all = reply[0].as_dict().unwrap();
    assert!(all.get(&"Secret".into()).is_none());
    assert_eq!(
        all.get(&"Fixed".into()).unwrap().as_variant().unwrap().value,
        Value::UInt16(7)
    );
}

#[tokio::test]
async fn phonebook_add_and_remove_contacts() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose(PHONEBOOK_NAME, &phonebook_service())
        .await
        .unwrap();
    let client = connect(&broker).await;

    let mut added = subscribe(
        &client,
        PHONEBOOK_PATH,
        standard::OBJECT_MANAGER_IFACE,
        "InterfacesAdded",
        "oa{sa{sv}}",
    )
    .await;
    let mut removed = subscribe(
        &client,
        PHONEBOOK_PATH,
        standard::OBJECT_MANAGER_IFACE,
        "InterfacesRemoved",
        "oas",
    )
    .await;

    let get_nb = |client: Arc<nbus::Bus>| async move {
        let reply = call(
            &client,
            PHONEBOOK_NAME,
            PHONEBOOK_PATH,
            standard::PROPERTIES_IFACE,
            "Get",
            "ss",
            &[PHONEBOOK_NAME.into(), "NbContacts".into()],
        )
        .await
        .unwrap();
        reply[0].as_variant().unwrap().value.clone()
    };

    assert_eq!(get_nb(client.clone()).await, Value::UInt16(0));

    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        PHONEBOOK_NAME,
        "AddContact",
        "ssq",
        &["Alice".into(), "555-1234".into(), Value::UInt16(25)],
    ))
    .await
    .unwrap();
    let Value::ObjectPath(alice) = reply[0].clone() else {
        panic!("AddContact must return an object path");
    };
    assert!(alice.starts_with("/com/example/PhoneBook/Contacts/"));
    assert_eq!(get_nb(client.clone()).await, Value::UInt16(1));

    // The announcement enumerates the contact's readable properties.
    let announcement = within(added.recv()).await.unwrap();
    assert_eq!(announcement[0], Value::ObjectPath(alice.clone()));
    let by_iface = announcement[1].as_dict().unwrap();
    let props = by_iface
        .get(&CONTACT_IFACE.into())
        .unwrap()
        .as_dict()
        .unwrap();
    assert_eq!(
        props.get(&"Name".into()).unwrap().as_variant().unwrap().value,
        Value::from("Alice")
    );
    assert_eq!(
        props.get(&"Age".into()).unwrap().as_variant().unwrap().value,
        Value::UInt16(25)
    );

    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        PHONEBOOK_NAME,
        "AddContact",
        "ssq",
        &["Bob".into(), "555-7890".into(), Value::UInt16(56)],
    ))
    .await
    .unwrap();
    let Value::ObjectPath(bob) = reply[0].clone() else {
        panic!("AddContact must return an object path");
    };
    let _ = within(added.recv()).await.unwrap();
    assert_eq!(get_nb(client.clone()).await, Value::UInt16(2));

    // Contacts reads back in insertion order.
    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        standard::PROPERTIES_IFACE,
        "Get",
        "ss",
        &[PHONEBOOK_NAME.into(), "Contacts".into()],
    ))
    .await
    .unwrap();
    let contacts = reply[0].as_variant().unwrap().value.clone();
    assert_eq!(
        contacts,
        Value::Array(vec![
            Value::Struct(vec![Value::ObjectPath(alice.clone()), "Alice".into()]),
            Value::Struct(vec![Value::ObjectPath(bob.clone()), "Bob".into()]),
        ])
    );

    within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        PHONEBOOK_NAME,
        "DeleteContacts",
        "ao",
        &[Value::Array(vec![Value::ObjectPath(bob.clone())])],
    ))
    .await
    .unwrap();

    // Whole-subtree removal announces with the empty interface list.
    let notice = within(removed.recv()).await.unwrap();
    assert_eq!(notice[0], Value::ObjectPath(bob.clone()));
    assert_eq!(notice[1], Value::Array(Vec::new()));

    assert_eq!(get_nb(client.clone()).await, Value::UInt16(1));
    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        standard::PROPERTIES_IFACE,
        "Get",
        "ss",
        &[PHONEBOOK_NAME.into(), "Contacts".into()],
    ))
    .await
    .unwrap();
    assert_eq!(
        reply[0].as_variant().unwrap().value,
        Value::Array(vec![Value::Struct(vec![
            Value::ObjectPath(alice.clone()),
            "Alice".into()
        ])])
    );

    // Calling into the removed object now fails with UnknownObject.
    let err = within(call(
        &client,
        PHONEBOOK_NAME,
        &bob,
        standard::PROPERTIES_IFACE,
        "GetAll",
        "s",
        &[CONTACT_IFACE.into()],
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, BusError::UnknownObject(_)));
}

#[tokio::test]
async fn get_managed_objects_enumerates_the_subtree() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose(PHONEBOOK_NAME, &phonebook_service())
        .await
        .unwrap();
    let client = connect(&broker).await;

    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        PHONEBOOK_NAME,
        "AddContact",
        "ssq",
        &["Carol".into(), "555-0000".into(), Value::UInt16(31)],
    ))
    .await
    .unwrap();
    let carol = reply[0].clone();

    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        PHONEBOOK_PATH,
        standard::OBJECT_MANAGER_IFACE,
        "GetManagedObjects",
        "",
        &[],
    ))
    .await
    .unwrap();
    let managed = reply[0].as_dict().unwrap();
    let contact = managed.get(&carol).unwrap().as_dict().unwrap();
    let props = contact
        .get(&CONTACT_IFACE.into())
        .unwrap()
        .as_dict()
        .unwrap();
    assert_eq!(
        props.get(&"Phone".into()).unwrap().as_variant().unwrap().value,
        Value::from("555-0000")
    );
}

#[tokio::test]
async fn introspection_lists_interfaces_and_children() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose(PHONEBOOK_NAME, &phonebook_service())
        .await
        .unwrap();
    let client = connect(&broker).await;

    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        "/",
        standard::INTROSPECTABLE_IFACE,
        "Introspect",
        "",
        &[],
    ))
    .await
    .unwrap();
    let Value::Str(xml) = &reply[0] else {
        panic!("Introspect returns a string");
    };
    assert!(xml.contains("-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"));
    assert!(xml.contains("<node name=\"com\"/>"));
    assert!(xml.contains(standard::PROPERTIES_IFACE));

    // Peer is served without any user registration.
    let reply = within(call(
        &client,
        PHONEBOOK_NAME,
        "/",
        standard::PEER_IFACE,
        "GetMachineId",
        "",
        &[],
    ))
    .await
    .unwrap();
    assert_eq!(reply[0], Value::Str(broker.machine_id()));

    within(call(
        &client,
        PHONEBOOK_NAME,
        "/",
        standard::PEER_IFACE,
        "Ping",
        "",
        &[],
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn interfaces_learn_of_exposure() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    let service = nbus::Service::new();
    let iface = Interface::builder("com.example.Aware")
        .unwrap()
        .build()
        .unwrap();
    let mut exposed = iface.exposed_events();
    service.root().add_interface(iface).unwrap();

    server.expose("com.example.Aware", &service).await.unwrap();
    let owner = within(exposed.recv()).await.unwrap();
    assert_eq!(owner, "com.example.Aware");
}

#[tokio::test]
async fn user_errors_carry_their_kind() {
    let iface = Interface::builder("com.example.Grumpy")
        .unwrap()
        .method("AlwaysFails", "", "", |_| async move {
            Err(BusError::user("OutOfCheese", "redo from start"))
        })
        .unwrap()
        .build()
        .unwrap();
    let service = nbus::Service::new();
    service.root().add_interface(iface).unwrap();

    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose("com.example.Grumpy", &service).await.unwrap();
    let client = connect(&broker).await;

    let err = within(call(
        &client,
        "com.example.Grumpy",
        "/",
        "com.example.Grumpy",
        "AlwaysFails",
        "",
        &[],
    ))
    .await
    .unwrap_err();
    let BusError::Call { name, message } = err else {
        panic!("user errors surface as named call errors");
    };
    assert_eq!(name, "org.freedesktop.DBus.OutOfCheese");
    assert_eq!(message, "redo from start");
}
