//! Run an eye scan end to end against the in-crate mock server.
//!
//! The mock stands in for a real debug server, so this example is
//! self-contained: `cargo run --example eye_scan`

use std::collections::HashMap;

use dbglink::mock::{MockScript, MockServer};
use dbglink::types::InstrumentKind;
use dbglink::{Capability, Client, Lane, ScanKind, ScanRegistry};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() -> dbglink::Result<()> {
    let script =
        MockScript::new().reply_return("start-eye-scan", json!({"handle": "scan-h0"}));
    let server = MockServer::start_tcp(script).await?;

    let client = Client::connect(server.endpoint()).await?;

    let lane = Lane::new(
        "lane-0",
        "RX lane 0",
        InstrumentKind::LinkTester,
        [Capability::EyeScan],
    );

    let registry = ScanRegistry::new(client.clone());
    let scan = registry.create(&lane, ScanKind::Eye, None)?;

    let mut config = HashMap::new();
    config.insert("horz-range".to_string(), json!("-0.25 to 0.25"));
    config.insert("dwell-ber".to_string(), json!("1e-7"));

    scan.start(&config).await?;
    println!("started {} on {}", scan.name(), lane.label());

    // A real server streams these; the mock lets us inject them.
    server.notify(
        "scan-h0",
        json!({"progress": 50, "points": [[0, 0, 1e-6, 1, 1000], [16, 0, 0.0, 0, 1000]]}),
    );
    server.notify(
        "scan-h0",
        json!({"progress": 100, "status": "done", "points": [[32, 0, 2e-7, 1, 1000]]}),
    );

    scan.wait().await?;
    println!("finished: {:?} ({}%)", scan.status(), scan.progress());

    if let Some(grid) = scan.result() {
        println!(
            "grid: {} cells over x range {:?}, floor {}",
            grid.len(),
            grid.x_range(),
            grid.floor()
        );
        for cell in grid.cells() {
            println!(
                "  x={:+.3} y={} rate={:.2e} errors={} samples={}",
                cell.x, cell.y, cell.rate, cell.errors, cell.samples
            );
        }
    }

    registry.delete(&[scan]);
    server.shutdown().await;
    Ok(())
}
