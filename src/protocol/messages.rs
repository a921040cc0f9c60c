//! Request and response bodies for each command, plus the public data
//! types they carry.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Free-form record delivered by an event stream subscription.
pub type EventRecord = HashMap<String, rmpv::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRequest {
    pub name: String,
    pub payload: ByteBuf,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForceLeaveRequest {
    pub node: String,
    pub prune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    pub existing: Vec<String>,
    pub replay: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct JoinResponse {
    pub num: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MembersFilteredRequest {
    pub tags: HashMap<String, String>,
    pub status: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRequest {
    #[serde(rename = "Type")]
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorRequest {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopRequest {
    pub stop: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRequest {
    pub filter_nodes: Vec<String>,
    pub filter_tags: HashMap<String, String>,
    pub request_ack: bool,
    pub relay_factor: u8,
    /// Maximum query duration in nanoseconds; 0 lets the agent choose.
    pub timeout: i64,
    pub name: String,
    pub payload: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RespondRequest {
    #[serde(rename = "ID")]
    pub id: u64,
    pub payload: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyRequest {
    pub key: String,
}

/// Union-shaped body shared by every key-management response. Only
/// `list-keys` populates `keys` and `num_nodes`; the install/use/remove
/// commands return `messages` alone, so every field is defaulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct KeyResponse {
    /// Per-node error or status messages, keyed by node name.
    pub messages: HashMap<String, String>,
    /// Keyring keys mapped to the number of nodes holding each.
    pub keys: HashMap<String, i64>,
    /// Number of nodes that reported.
    pub num_nodes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagsRequest {
    pub tags: HashMap<String, String>,
    pub delete_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoordinateRequest {
    pub node: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CoordinateResponse {
    pub ok: bool,
    pub coord: Coordinate,
}

/// One line from a log monitor subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogRecord {
    pub log: String,
}

/// One record from a query subscription, tagged `ack`, `response`, or
/// `done`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueryRecord {
    #[serde(rename = "Type")]
    pub record_type: String,
    pub from: String,
    pub payload: ByteBuf,
}

/// A known member of the cluster, as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Member {
    pub name: String,
    /// Raw address bytes, 4 (IPv4) or 16 (IPv6); see [`Member::ip`].
    pub addr: ByteBuf,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: String,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl Member {
    /// The member's address, if the agent sent a well-formed one.
    /// IPv4-mapped IPv6 addresses collapse to IPv4.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.addr.len() {
            4 => {
                let octets: [u8; 4] = self.addr[..].try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = self.addr[..].try_into().ok()?;
                let v6 = Ipv6Addr::from(octets);
                match v6.to_ipv4_mapped() {
                    Some(v4) => Some(IpAddr::from(v4)),
                    None => Some(IpAddr::from(v6)),
                }
            }
            _ => None,
        }
    }
}

/// Network coordinate of a node, for round-trip estimation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

/// A single node's answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}
