use dbglink::mock::{MockScript, MockServer};
use dbglink::types::InstrumentKind;
use dbglink::{Client, Listener, ObjectId, UpdateQueue};

#[tokio::test]
async fn client_can_execute_and_receive_notifications() -> dbglink::Result<()> {
    let script = MockScript::new()
        .reply_return(
            "read-properties",
            serde_json::json!({"temperature": 41.5, "link-up": true}),
        )
        .post_notify(serde_json::json!({
            "notify": "lane-0",
            "changed": {"link-up": false},
            "timestamp": {"seconds": 0, "microseconds": 0}
        }));

    let server = MockServer::start_tcp(script).await?;
    let client = Client::connect(server.endpoint()).await?;

    let greeting = client.greeting();
    assert_eq!(greeting.server.instruments.len(), 1);
    assert_eq!(
        greeting.server.instruments[0].kind,
        InstrumentKind::LinkTester
    );

    let mut notifications = client.notifications();

    let lane = ObjectId::from("lane-0");
    let props = client
        .get_properties(&lane, &["temperature", "link-up"])
        .await?;
    assert_eq!(
        props.get("temperature").and_then(|v| v.as_f64()),
        Some(41.5)
    );

    let msg = notifications.recv().await?;
    assert_eq!(msg.object, lane);
    assert_eq!(
        msg.changed.get("link-up"),
        Some(&serde_json::Value::from(false))
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn remote_errors_surface_with_class_and_description() -> dbglink::Result<()> {
    let script =
        MockScript::new().reply_error("read-properties", "ObjectNotFound", "no such lane");

    let server = MockServer::start_tcp(script).await?;
    let client = Client::connect(server.endpoint()).await?;

    let err = client
        .get_properties(&ObjectId::from("lane-9"), &["temperature"])
        .await
        .expect_err("must fail");
    assert_eq!(err.kind(), dbglink::ErrorKind::Remote);
    assert!(err.to_string().contains("ObjectNotFound"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bus_routes_injected_updates_to_subscribers() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(MockScript::new()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = ObjectId::from("lane-0");
    let bus = client.bus(&lane);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener: Listener = std::sync::Arc::new(move |queue: &UpdateQueue| {
        for event in queue.drain() {
            let _ = tx.send(event);
        }
    });
    bus.subscribe(["link-up", "temperature"], vec![listener])?;

    server.notify("lane-0", serde_json::json!({"link-up": true, "other": 1}));

    let event = rx.recv().await.expect("update delivered");
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.get("link-up"), Some(&serde_json::Value::from(true)));

    server.shutdown().await;
    Ok(())
}
