//! Tails the logs of a local meshd agent until interrupted.
//!
//! Usage: `cargo run --example monitor [addr] [level]`

use meshd_client::RpcClient;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7373".to_string());
    let level = args.next().unwrap_or_else(|| "INFO".to_string());

    let client = RpcClient::connect(&addr).await?;

    let (log_tx, mut log_rx) = mpsc::channel(64);
    let handle = client.monitor(&level, log_tx).await?;

    loop {
        tokio::select! {
            line = log_rx.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop(handle).await.ok();
    client.close().await?;
    Ok(())
}
