//! Lists the cluster members known to a local meshd agent.
//!
//! Usage: `cargo run --example members [addr]` (default 127.0.0.1:7373)

use meshd_client::RpcClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7373".to_string());

    let client = RpcClient::connect(&addr).await?;

    for member in client.members().await? {
        let ip = member
            .ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("{:<24} {}:{:<5} {}", member.name, ip, member.port, member.status);
    }

    client.close().await?;
    Ok(())
}
