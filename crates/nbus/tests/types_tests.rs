//! Type fidelity through the full stack: every value class crosses the
//! bridge twice (server out, client in) and must arrive exactly as
//! declared.

mod common;

use common::*;
use nbus::{Broker, Value};

#[tokio::test]
async fn every_type_survives_the_round_trip() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose("com.example.TypesOverview", &types_service())
        .await
        .unwrap();

    let client = connect(&broker).await;
    let proxy = client.proxy("com.example.TypesOverview").unwrap().build();
    within(proxy.wait_connected()).await.unwrap();
    let iface = proxy.interface("/", "com.example.TypesOverview").unwrap();

    let cases: Vec<(&str, Value)> = vec![
        ("GetUint16", Value::UInt16(54827)),
        ("GetInt16", Value::Int16(-29786)),
        ("GetUint32", Value::UInt32(3_728_666_323)),
        ("GetInt32", Value::Int32(-1_829_732_118)),
        ("GetDouble", Value::Double(129_387.978_674_2)),
        ("GetBool", Value::Bool(false)),
        (
            "GetObjectPath",
            Value::ObjectPath("/path/to/some/dbus/object".into()),
        ),
        (
            "GetStringArray",
            Value::Array(vec![
                "foo".into(),
                "bar".into(),
                "quux".into(),
                "hello, world!".into(),
            ]),
        ),
        (
            "GetStruct",
            Value::Struct(vec![
                true.into(),
                42.1089f64.into(),
                "Just a string...".into(),
            ]),
        ),
    ];
    for (method, expected) in cases {
        let reply = within(iface.call(method, vec![])).await.unwrap();
        assert_eq!(reply, vec![expected], "{method}");
    }
}

#[tokio::test]
async fn multi_output_methods_return_one_value_per_output() {
    let broker = Broker::new();
    let server = connect(&broker).await;
    server
        .expose("com.example.TypesOverview", &types_service())
        .await
        .unwrap();

    let client = connect(&broker).await;
    let proxy = client.proxy("com.example.TypesOverview").unwrap().build();
    within(proxy.wait_connected()).await.unwrap();
    let iface = proxy.interface("/", "com.example.TypesOverview").unwrap();

    let reply = within(iface.call("GetMultiple", vec![])).await.unwrap();
    assert_eq!(
        reply,
        vec![
            Value::from("String as argument #1"),
            Value::Bool(false),
            Value::Int32(-52_395_872),
        ]
    );
}
