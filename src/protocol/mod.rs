//! Wire protocol for the meshd agent IPC channel.
//!
//! Every message is a MsgPack-encoded header optionally followed by a
//! MsgPack-encoded body, back-to-back on the same stream. Requests carry
//! a command tag and a sequence number; responses echo the sequence plus
//! an error string (empty on success). Field names ride the wire
//! verbatim, which is why the structs here rename to PascalCase.

mod messages;

pub use messages::{
    AuthRequest, Coordinate, CoordinateRequest, CoordinateResponse, EventRecord, EventRequest,
    ForceLeaveRequest, HandshakeRequest, JoinRequest, JoinResponse, KeyRequest, KeyResponse,
    LogRecord, Member, MembersFilteredRequest, MembersResponse, MonitorRequest, NodeResponse,
    QueryRecord, QueryRequest, RespondRequest, StopRequest, StreamRequest, TagsRequest,
};

use serde::{Deserialize, Serialize};

/// Highest IPC protocol version this client speaks, sent in the
/// handshake.
pub const MAX_IPC_VERSION: i32 = 1;

/// Error string the agent returns when a command requires authentication.
/// The one sentinel recognized at this layer: it suppresses body
/// decoding, because the agent sends no body with it.
pub const AUTH_REQUIRED: &str = "Authentication required";

pub const HANDSHAKE_COMMAND: &str = "handshake";
pub const AUTH_COMMAND: &str = "auth";
pub const EVENT_COMMAND: &str = "event";
pub const FORCE_LEAVE_COMMAND: &str = "force-leave";
pub const JOIN_COMMAND: &str = "join";
pub const MEMBERS_COMMAND: &str = "members";
pub const MEMBERS_FILTERED_COMMAND: &str = "members-filtered";
pub const STREAM_COMMAND: &str = "stream";
pub const MONITOR_COMMAND: &str = "monitor";
pub const STOP_COMMAND: &str = "stop";
pub const LEAVE_COMMAND: &str = "leave";
pub const QUERY_COMMAND: &str = "query";
pub const RESPOND_COMMAND: &str = "respond";
pub const INSTALL_KEY_COMMAND: &str = "install-key";
pub const USE_KEY_COMMAND: &str = "use-key";
pub const REMOVE_KEY_COMMAND: &str = "remove-key";
pub const LIST_KEYS_COMMAND: &str = "list-keys";
pub const TAGS_COMMAND: &str = "tags";
pub const STATS_COMMAND: &str = "stats";
pub const GET_COORDINATE_COMMAND: &str = "get-coordinate";

/// Record tags inside a query subscription.
pub const QUERY_RECORD_ACK: &str = "ack";
pub const QUERY_RECORD_RESPONSE: &str = "response";
pub const QUERY_RECORD_DONE: &str = "done";

/// Header preceding every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestHeader {
    pub command: String,
    pub seq: u64,
}

impl RequestHeader {
    pub fn new(command: &str, seq: u64) -> Self {
        Self {
            command: command.to_string(),
            seq,
        }
    }
}

/// Header preceding every response frame.
///
/// Fields are defaulted: when a record body for a deregistered sequence
/// gets decoded as a header on the next reader pass, it yields an inert
/// seq-0 header (sequence numbers start at 1) instead of a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ResponseHeader {
    pub seq: u64,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_named;

    #[test]
    fn test_request_header_wire_field_names() {
        let header = RequestHeader::new(MEMBERS_COMMAND, 3);
        let bytes = encode_named(&header).unwrap();
        let value: rmpv::Value = rmp_serde::from_slice(&bytes).unwrap();

        let map = value.as_map().expect("header must encode as a map");
        let keys: Vec<&str> = map.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["Command", "Seq"]);
    }

    #[test]
    fn test_response_header_round_trip() {
        let header = ResponseHeader {
            seq: 42,
            error: "boom".to_string(),
        };
        let bytes = encode_named(&header).unwrap();
        let decoded: ResponseHeader = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.error, "boom");
    }

    #[test]
    fn test_foreign_value_decodes_as_inert_header() {
        let record = LogRecord {
            log: "orphaned line".to_string(),
        };
        let bytes = encode_named(&record).unwrap();
        let decoded: ResponseHeader = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded.seq, 0);
        assert!(decoded.error.is_empty());
    }
}
