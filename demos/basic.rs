//! Connect to a debug server, print its greeting, and read a few lane
//! properties.
//!
//! Usage: `cargo run --example basic -- <host> <port>`

use dbglink::{Client, Endpoint, ObjectId};

#[tokio::main(flavor = "current_thread")]
async fn main() -> dbglink::Result<()> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3121);

    let client = Client::connect(Endpoint::tcp(host, port)).await?;

    let greeting = client.greeting();
    println!(
        "connected to {} v{}.{}.{}",
        greeting.server.package,
        greeting.server.version.major,
        greeting.server.version.minor,
        greeting.server.version.micro,
    );

    for instrument in &greeting.server.instruments {
        println!("instrument {} ({:?})", instrument.id, instrument.kind);
        for lane in &instrument.lanes {
            let props = client
                .get_properties(lane, &["link-up", "temperature"])
                .await?;
            println!("  lane {lane}: {props:?}");
        }
    }

    // Watch the raw notification stream for a moment.
    let mut notifications = client.notifications();
    let deadline = tokio::time::sleep(std::time::Duration::from_secs(5));
    tokio::pin!(deadline);

    let lane = ObjectId::from("lane-0");
    loop {
        tokio::select! {
            msg = notifications.recv() => {
                let msg = msg?;
                if msg.object == lane {
                    println!("lane-0 changed: {:?}", msg.changed);
                }
            }
            _ = &mut deadline => break,
        }
    }

    Ok(())
}
