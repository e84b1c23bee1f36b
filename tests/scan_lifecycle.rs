use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dbglink::mock::{MockScript, MockServer};
use dbglink::types::InstrumentKind;
use dbglink::{Capability, Client, Lane, ScanKind, ScanRegistry, ScanStatus};
use serde_json::json;

fn eye_lane(object: &str) -> Lane {
    Lane::new(
        object,
        format!("RX {object}"),
        InstrumentKind::LinkTester,
        [Capability::EyeScan, Capability::SlicerScan],
    )
}

fn eye_script() -> MockScript {
    MockScript::new()
        .reply_return("start-eye-scan", json!({"handle": "scan-h0"}))
        .reply_return("start-slicer-scan", json!({"handle": "scan-h1"}))
        .reply_return("terminate", json!({}))
}

async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn scan_runs_to_done_and_reduces_a_grid() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = eye_lane("lane-0");
    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Eye, None)?;
    assert_eq!(scan.name(), "Scan_0");
    assert_eq!(scan.status(), ScanStatus::NotStarted);

    let completions = Arc::new(AtomicUsize::new(0));
    let completions2 = completions.clone();
    scan.on_complete(move |status| {
        assert_eq!(status, ScanStatus::Done);
        completions2.fetch_add(1, Ordering::SeqCst);
    });

    scan.start(&HashMap::new()).await?;

    server.notify(
        "scan-h0",
        json!({
            "progress": 30,
            "start-time": {"seconds": 100, "microseconds": 0},
            "firmware": "lt-fw 2.7",
            "expected-samples": 3,
            "telemetry": {"x": [0], "err": [0.0]},
            "points": [[0, 0, 0.0, 0, 1000]]
        }),
    );
    server.notify(
        "scan-h0",
        json!({
            "progress": 60,
            "telemetry": {"x": [32], "err": [1.0]},
            "points": [[32, 0, 1e-6, 2, 1000]]
        }),
    );
    server.notify(
        "scan-h0",
        json!({
            "progress": 100,
            "status": "done",
            "stop-time": {"seconds": 160, "microseconds": 0},
            "telemetry": {"x": [64], "err": [0.0]},
            "points": [[64, 0, 0.0, 0, 1000]]
        }),
    );

    scan.wait().await?;

    assert_eq!(scan.status(), ScanStatus::Done);
    assert_eq!(scan.progress(), 100.0);
    assert_eq!(scan.started_at().map(|t| t.seconds), Some(100));
    assert_eq!(scan.stopped_at().map(|t| t.seconds), Some(160));
    assert_eq!(scan.firmware().as_deref(), Some("lt-fw 2.7"));
    assert_eq!(scan.expected_samples(), Some(3));

    // Telemetry chunks were appended in order, fields kept parallel.
    let telemetry = scan.telemetry();
    assert_eq!(telemetry.len(), 3);
    assert_eq!(telemetry.field("x"), Some([0.0, 32.0, 64.0].as_slice()));

    // The final grid includes the terminal batch's own points, with the x
    // axis rescaled into the default -0.5..0.5 range.
    let grid = scan.result().expect("grid built on done");
    assert_eq!(grid.len(), 3);
    let xs: Vec<f64> = grid.cells().iter().map(|c| c.x).collect();
    assert_eq!(xs, vec![-0.5, 0.0, 0.5]);
    assert_eq!(grid.floor(), 1e-12);

    assert_eq!(completions.load(Ordering::SeqCst), 1);

    // A wait after the terminal state returns immediately.
    scan.wait().await?;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_coordinates_merge_across_events() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = eye_lane("lane-0");
    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Eye, None)?;
    scan.start(&HashMap::new()).await?;

    server.notify("scan-h0", json!({"points": [[2, 3, 1e-6, 0, 1000]]}));
    server.notify("scan-h0", json!({"points": [[2, 3, 2e-6, 4, 1000]]}));
    server.notify("scan-h0", json!({"status": "done"}));

    scan.wait().await?;

    let points = scan.points();
    let p = points.get(2, 3).expect("merged point");
    assert!((p.rate - 3e-6).abs() < 1e-12);
    assert_eq!(p.errors, 4);
    assert_eq!(p.samples, 2000);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stop_leads_to_aborted_via_the_update_path() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = eye_lane("lane-0");
    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Slicer, None)?;
    scan.start(&HashMap::new()).await?;

    server.notify("scan-h1", json!({"progress": 10}));
    until(|| scan.status() == ScanStatus::InProgress).await;

    // stop() does not change local state by itself.
    scan.stop().await?;
    assert_eq!(scan.status(), ScanStatus::InProgress);

    server.notify("scan-h1", json!({"status": "aborted: stop requested"}));
    scan.wait().await?;

    assert_eq!(scan.status(), ScanStatus::Aborted);
    assert_eq!(
        scan.status_text().as_deref(),
        Some("aborted: stop requested")
    );
    assert!(scan.result().is_none());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restart_while_in_progress_is_rejected() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = eye_lane("lane-0");
    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Eye, None)?;
    scan.start(&HashMap::new()).await?;

    server.notify("scan-h0", json!({"progress": 5}));
    until(|| scan.status() == ScanStatus::InProgress).await;

    let err = scan.start(&HashMap::new()).await.expect_err("must reject");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    // The running cycle is untouched.
    assert_eq!(scan.status(), ScanStatus::InProgress);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restart_after_done_resets_accumulated_data() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let lane = eye_lane("lane-0");
    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Eye, None)?;

    scan.start(&HashMap::new()).await?;
    server.notify(
        "scan-h0",
        json!({"progress": 100, "status": "done", "points": [[0, 0, 1e-6, 1, 10]]}),
    );
    scan.wait().await?;
    assert!(scan.result().is_some());

    scan.start(&HashMap::new()).await?;
    assert_eq!(scan.status(), ScanStatus::NotStarted);
    assert_eq!(scan.progress(), 0.0);
    assert!(scan.result().is_none());
    assert!(scan.points().is_empty());
    assert!(scan.telemetry().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn registry_names_are_monotonic_and_reset_when_empty() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let registry = ScanRegistry::new(client.clone());
    let lane_a = eye_lane("lane-0");
    let lane_b = eye_lane("lane-1");

    let a = registry.create(&lane_a, ScanKind::Eye, None)?;
    let b = registry.create(&lane_b, ScanKind::Eye, None)?;
    assert_eq!(a.name(), "Scan_0");
    assert_eq!(b.name(), "Scan_1");

    // Deleting one scan does not free its suffix while others live.
    registry.delete(&[a]);
    let c = registry.create(&lane_a, ScanKind::Eye, None)?;
    assert_eq!(c.name(), "Scan_2");

    registry.delete(&[b, c]);
    assert!(registry.is_empty());

    let d = registry.create(&lane_a, ScanKind::Eye, None)?;
    assert_eq!(d.name(), "Scan_0");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn delete_invalidates_and_clears_lane_back_references() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let registry = ScanRegistry::new(client.clone());
    let lane = eye_lane("lane-0");

    let scan = registry.create(&lane, ScanKind::Eye, None)?;
    assert!(lane.current_scan().is_some());
    assert_eq!(lane.scan_names(), vec!["Scan_0".to_string()]);

    registry.delete(&[scan.clone()]);

    assert!(scan.is_invalidated());
    assert!(lane.current_scan().is_none());
    assert!(lane.scan_names().is_empty());
    assert!(registry.get("Scan_0").is_none());

    // Invalidation is idempotent and later use errors cleanly.
    scan.invalidate();
    let err = scan.start(&HashMap::new()).await.expect_err("must reject");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lifecycle_errors_before_start() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&eye_lane("lane-0"), ScanKind::Eye, None)?;

    let err = scan.wait().await.expect_err("wait before start");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    let err = scan.stop().await.expect_err("stop before start");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_capability_is_rejected_at_create() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let plain = Lane::new(
        "lane-7",
        "RX lane-7",
        InstrumentKind::LinkTester,
        [] as [Capability; 0],
    );
    let registry = ScanRegistry::new(client.clone());

    let err = registry
        .create(&plain, ScanKind::Eye, None)
        .expect_err("must reject");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_start_leaves_the_operation_not_started() -> dbglink::Result<()> {
    let script = MockScript::new().reply_error("start-eye-scan", "LaneBusy", "lane in use");
    let server = MockServer::start_tcp(script).await?;
    let client = Client::connect(server.endpoint()).await?;

    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&eye_lane("lane-0"), ScanKind::Eye, None)?;

    let err = scan.start(&HashMap::new()).await.expect_err("must fail");
    assert_eq!(err.kind(), dbglink::ErrorKind::Remote);
    assert_eq!(scan.status(), ScanStatus::NotStarted);

    // And wait() still treats the scan as never started.
    let err = scan.wait().await.expect_err("wait after failed start");
    assert_eq!(err.kind(), dbglink::ErrorKind::State);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn panicking_completion_callback_is_contained() -> dbglink::Result<()> {
    let server = MockServer::start_tcp(eye_script()).await?;
    let client = Client::connect(server.endpoint()).await?;

    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&eye_lane("lane-0"), ScanKind::Eye, None)?;
    scan.on_complete(|_status| panic!("callback bug"));

    scan.start(&HashMap::new()).await?;
    server.notify("scan-h0", json!({"status": "done"}));

    // The panic is caught on the dispatch side; wait() still completes and
    // the terminal state is recorded.
    scan.wait().await?;
    assert_eq!(scan.status(), ScanStatus::Done);

    server.shutdown().await;
    Ok(())
}
