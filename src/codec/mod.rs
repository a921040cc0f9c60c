//! MsgPack codec bridge.
//!
//! The agent speaks self-describing MessagePack: every message is one
//! encoded value (the header) optionally followed by a second encoded
//! value (the body), with no length prefix. Structs go on the wire as
//! maps with field names, so encoding always uses `to_vec_named`.
//!
//! Outbound values are encoded into a buffer with [`encode_named`] and
//! written in one serialized flush. Inbound values are pulled off the
//! socket by a single [`StreamDecoder`], which both the reader loop
//! (headers) and the per-sequence handlers (bodies) consume in turn.

mod stream;

pub use stream::StreamDecoder;

use serde::Serialize;

use crate::error::Result;

/// Encode a value to MsgPack bytes, structs as maps.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
#[inline]
pub fn encode_named<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}
