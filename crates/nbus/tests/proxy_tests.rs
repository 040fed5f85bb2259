//! Proxy scenarios over the embedded broker: introspected mirrors, cached
//! properties, signal streams, service activation and owner-change
//! resilience.

mod common;

use common::*;
use nbus::{standard, Broker, Bus, BusError, ProxyEvent, Value};
use std::sync::Arc;
use std::time::Duration;

async fn connected_proxy(client: &Arc<Bus>, name: &str) -> Arc<nbus::Proxy> {
    let proxy = client.proxy(name).unwrap().build();
    within(proxy.wait_connected()).await.unwrap();
    proxy
}

#[tokio::test]
async fn methods_and_cached_properties_through_a_proxy() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();

    let client = connect(&broker).await;
    let proxy = connected_proxy(&client, SIMPLE_NAME).await;
    let iface = proxy.interface("/", SIMPLE_NAME).expect("mirrored");

    let reply = within(iface.call("SayHello", vec!["".into()])).await.unwrap();
    assert_eq!(reply, vec![Value::from("Hello, world!")]);
    let reply = within(iface.call("SayHello", vec!["Alice".into()]))
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::from("Hello, Alice!")]);

    // The GetAll pass primed the cache.
    assert_eq!(iface.cached("ExampleProperty").unwrap(), Value::UInt16(1089));

    // Arity is checked before anything goes on the wire.
    let err = iface.call("SayHello", vec![]).await.unwrap_err();
    assert!(matches!(err, BusError::Call { .. }));
}

#[tokio::test]
async fn set_updates_the_cache_through_properties_changed() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();

    let client = connect(&broker).await;
    let proxy = connected_proxy(&client, SIMPLE_NAME).await;
    let iface = proxy.interface("/", SIMPLE_NAME).unwrap();
    let props = proxy
        .interface("/", standard::PROPERTIES_IFACE)
        .expect("standard interfaces are mirrored");
    let mut changes = props.subscribe("PropertiesChanged").unwrap();

    within(iface.set("ExampleProperty", Value::UInt16(42)))
        .await
        .unwrap();

    // The mirrored signal fires after the cache update, so the cache is
    // consistent once it arrives.
    let change = within(changes.recv()).await.unwrap();
    assert_eq!(change[0], Value::from(SIMPLE_NAME));
    assert_eq!(iface.cached("ExampleProperty").unwrap(), Value::UInt16(42));
}

#[tokio::test]
async fn user_signals_stream_through_the_mirror() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();

    let client = connect(&broker).await;
    let proxy = connected_proxy(&client, SIMPLE_NAME).await;
    let iface = proxy.interface("/", SIMPLE_NAME).unwrap();
    let mut greeted = iface.subscribe("Greeted").unwrap();

    within(iface.call("SayHello", vec!["Bob".into()])).await.unwrap();
    let args = within(greeted.recv()).await.unwrap();
    assert_eq!(args, vec![Value::from("Bob")]);
}

#[tokio::test]
async fn activation_starts_an_offline_service() {
    let broker = Broker::new();
    let server_broker = broker.clone();
    broker.register_activatable(
        "com.example.ActivatableOnly",
        Arc::new(move || {
            let broker = server_broker.clone();
            Box::pin(async move {
                let bus = Bus::connect(broker.connect()).await.expect("activation bus");
                bus.expose("com.example.ActivatableOnly", &simple_service())
                    .await
                    .expect("activation expose");
                // Keep the service's connection alive.
                std::mem::forget(bus);
            })
        }),
    );

    let client = connect(&broker).await;
    assert!(!client
        .name_has_owner("com.example.ActivatableOnly")
        .await
        .unwrap());

    let proxy = client.proxy("com.example.ActivatableOnly").unwrap().build();
    let mut events = proxy.events();
    within(proxy.wait_connected()).await.unwrap();
    assert!(matches!(
        within(events.recv()).await.unwrap(),
        ProxyEvent::Connected
    ));

    let iface = proxy.interface("/", SIMPLE_NAME).unwrap();
    let reply = within(iface.call("SayHello", vec!["".into()])).await.unwrap();
    assert_eq!(reply, vec![Value::from("Hello, world!")]);
}

#[tokio::test]
async fn owner_changes_drive_disconnect_and_reconnect() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    let service = simple_service();
    server.expose(SIMPLE_NAME, &service).await.unwrap();

    let client = connect(&broker).await;
    let proxy = connected_proxy(&client, SIMPLE_NAME).await;
    let mut events = proxy.events();
    assert_eq!(
        proxy
            .interface("/", SIMPLE_NAME)
            .unwrap()
            .cached("ExampleProperty")
            .unwrap(),
        Value::UInt16(1089)
    );

    server.withdraw(SIMPLE_NAME).await.unwrap();
    loop {
        match within(events.recv()).await.unwrap() {
            ProxyEvent::Disconnected => break,
            _ => continue,
        }
    }
    assert!(!proxy.is_connected());

    // Change state while offline; the refreshed mirror must observe it.
    service
        .root()
        .interface(SIMPLE_NAME)
        .unwrap()
        .set_property("ExampleProperty", Value::UInt16(7))
        .unwrap();

    server.expose(SIMPLE_NAME, &service).await.unwrap();
    loop {
        match within(events.recv()).await.unwrap() {
            ProxyEvent::Connected => break,
            _ => continue,
        }
    }
    within(proxy.wait_connected()).await.unwrap();
    assert_eq!(
        proxy
            .interface("/", SIMPLE_NAME)
            .unwrap()
            .cached("ExampleProperty")
            .unwrap(),
        Value::UInt16(7)
    );
}

#[tokio::test]
async fn object_manager_keeps_the_mirror_in_step() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose(PHONEBOOK_NAME, &phonebook_service())
        .await
        .unwrap();

    let client = connect(&broker).await;
    let proxy = connected_proxy(&client, PHONEBOOK_NAME).await;
    let book = proxy.interface(PHONEBOOK_PATH, PHONEBOOK_NAME).unwrap();
    let manager = proxy
        .interface(PHONEBOOK_PATH, standard::OBJECT_MANAGER_IFACE)
        .unwrap();
    let mut added = manager.subscribe("InterfacesAdded").unwrap();
    let mut removed = manager.subscribe("InterfacesRemoved").unwrap();

    let reply = within(book.call(
        "AddContact",
        vec!["Alice".into(), "555-1234".into(), Value::UInt16(25)],
    ))
    .await
    .unwrap();
    let Value::ObjectPath(alice) = reply[0].clone() else {
        panic!("AddContact must return an object path");
    };

    // The mirrored InterfacesAdded fires once the new object has been
    // introspected into the tree.
    let announcement = within(added.recv()).await.unwrap();
    assert_eq!(announcement[0], Value::ObjectPath(alice.clone()));
    let contact = proxy
        .interface(&alice, CONTACT_IFACE)
        .expect("contact mirrored");
    assert_eq!(contact.cached("Name").unwrap(), Value::from("Alice"));
    assert_eq!(contact.cached("Age").unwrap(), Value::UInt16(25));

    within(book.call(
        "DeleteContacts",
        vec![Value::Array(vec![Value::ObjectPath(alice.clone())])],
    ))
    .await
    .unwrap();
    let notice = within(removed.recv()).await.unwrap();
    assert_eq!(notice[0], Value::ObjectPath(alice.clone()));
    assert!(proxy.object(&alice).is_none());
}

#[tokio::test]
async fn depth_bound_prunes_the_mirror() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose(PHONEBOOK_NAME, &phonebook_service())
        .await
        .unwrap();

    let client = connect(&broker).await;
    let proxy = client
        .proxy(PHONEBOOK_NAME)
        .unwrap()
        .max_depth(2)
        .build();
    within(proxy.wait_connected()).await.unwrap();

    // "/" is depth 1, "/com" is depth 2, "/com/example" is depth 3.
    assert!(proxy.object("/").is_some());
    assert!(proxy.object("/com").is_some());
    assert!(proxy.object("/com/example").is_none());
}

#[tokio::test]
async fn target_interface_restricts_the_mirror() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    let service = simple_service();
    let extra = nbus::Interface::builder("com.example.Extra")
        .unwrap()
        .build()
        .unwrap();
    service.root().add_interface(extra).unwrap();
    server.expose(SIMPLE_NAME, &service).await.unwrap();

    let client = connect(&broker).await;
    let proxy = client
        .proxy(SIMPLE_NAME)
        .unwrap()
        .target_interface(SIMPLE_NAME)
        .unwrap()
        .build();
    within(proxy.wait_connected()).await.unwrap();

    assert!(proxy.interface("/", SIMPLE_NAME).is_some());
    assert!(proxy.interface("/", "com.example.Extra").is_none());
}

#[tokio::test]
async fn proxy_to_an_unowned_inactive_name_connects_when_it_appears() {
    let broker = Broker::new();
    let client = connect(&broker).await;
    let proxy = client.proxy(SIMPLE_NAME).unwrap().build();

    // Nothing owns the name yet; the proxy stays pending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!proxy.is_connected());

    let server = connect(&broker).await;
    server.expose(SIMPLE_NAME, &simple_service()).await.unwrap();
    within(proxy.wait_connected()).await.unwrap();
    let iface = proxy.interface("/", SIMPLE_NAME).unwrap();
    assert_eq!(iface.cached("ExampleProperty").unwrap(), Value::UInt16(1089));
}
