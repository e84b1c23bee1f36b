use dbglink::mock::{ReplayServer, Transcript};
use dbglink::{Client, ObjectId};

const SESSION: &str = r#"
{"dir":"server","msg":{"dbglink":{"version":{"major":1,"minor":4,"micro":0},"package":"mock"}}}
{"dir":"client","msg":{"execute":"attach","id":0}}
{"dir":"server","msg":{"return":{},"id":0}}
{"dir":"client","msg":{"execute":"read-properties","object":"lane-0","arguments":{"names":["temperature"]},"id":1}}
{"dir":"server","msg":{"return":{"temperature":41.5},"id":1}}
"#;

#[tokio::test]
async fn recorded_session_replays_against_the_client() -> dbglink::Result<()> {
    let transcript = Transcript::from_jsonl_str(SESSION)?;
    assert_eq!(transcript.steps.len(), 5);

    let server = ReplayServer::start_tcp(transcript).await?;
    let client = Client::connect(server.endpoint()).await?;

    let props = client
        .get_properties(&ObjectId::from("lane-0"), &["temperature"])
        .await?;
    assert_eq!(
        props.get("temperature").and_then(|v| v.as_f64()),
        Some(41.5)
    );

    server.shutdown().await;
    Ok(())
}

#[test]
fn malformed_jsonl_is_rejected_with_the_offending_line() {
    let err = Transcript::from_jsonl_str("{\"dir\":\"server\"").unwrap_err();
    assert_eq!(err.kind(), dbglink::ErrorKind::Protocol);
    assert!(err.to_string().contains("line 1"));
}
