//! Error types for meshd-client.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the agent connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A response body did not match the expected shape.
    #[error("invalid response body: {0}")]
    Body(#[from] rmpv::ext::Error),

    /// Operation attempted after the client shut down, or a pending
    /// operation interrupted by shutdown.
    #[error("client closed")]
    ClientClosed,

    /// The agent closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A subscription handler was cleaned up before its initial reply.
    #[error("stream closed")]
    StreamClosed,

    /// Subscription initialization did not complete within its deadline.
    #[error("request timeout")]
    RequestTimeout,

    /// Textual error returned by the agent, passed through verbatim.
    #[error("{0}")]
    Agent(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
