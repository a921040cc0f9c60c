//! # meshd-client
//!
//! Async Rust client for the meshd cluster-membership agent's RPC
//! channel.
//!
//! A single TCP connection carries both short request/reply commands
//! (join, members, leave, keyring management, stats) and long-lived
//! subscriptions (log monitors, event streams, distributed queries)
//! that deliver an unbounded sequence of records. The client multiplexes
//! everything by sequence number: one background reader task
//! demultiplexes inbound frames to per-request handlers, and a write
//! mutex serializes outbound frames.
//!
//! ## Example
//!
//! ```ignore
//! use meshd_client::RpcClient;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> meshd_client::Result<()> {
//!     let client = RpcClient::connect("127.0.0.1:7373").await?;
//!
//!     let (log_tx, mut log_rx) = mpsc::channel(64);
//!     let handle = client.monitor("INFO", log_tx).await?;
//!     while let Some(line) = log_rx.recv().await {
//!         println!("{line}");
//!     }
//!
//!     client.stop(handle).await?;
//!     client.close().await
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;

mod client;
mod dispatch;
mod handler;

pub use client::{Config, QueryParams, RpcClient, StreamHandle, DEFAULT_TIMEOUT};
pub use error::{Result, RpcError};
pub use protocol::{Coordinate, EventRecord, KeyResponse, Member, NodeResponse};
