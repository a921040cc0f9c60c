//! RPC client for the meshd agent.
//!
//! The [`RpcClient`] multiplexes concurrent requests over one TCP
//! connection. Lifecycle:
//! 1. Dial the agent (with timeout)
//! 2. Spawn the reader loop
//! 3. Send `handshake` (and `auth` when a key is configured)
//! 4. Serve calls and subscriptions until `close`
//!
//! Outbound frames are serialized by a write mutex; inbound frames are
//! consumed by a single reader task that dispatches each response to the
//! handler registered under its sequence number.
//!
//! # Example
//!
//! ```ignore
//! use meshd_client::RpcClient;
//!
//! #[tokio::main]
//! async fn main() -> meshd_client::Result<()> {
//!     let client = RpcClient::connect("127.0.0.1:7373").await?;
//!     for member in client.members().await? {
//!         println!("{} {}", member.name, member.status);
//!     }
//!     client.close().await
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::ByteBuf;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::codec::{self, StreamDecoder};
use crate::dispatch::DispatchTable;
use crate::error::{Result, RpcError};
use crate::handler::{Control, InitWaiter, SeqHandler};
use crate::protocol::{
    AuthRequest, Coordinate, CoordinateRequest, CoordinateResponse, EventRecord, EventRequest,
    ForceLeaveRequest, HandshakeRequest, JoinRequest, JoinResponse, KeyRequest, KeyResponse,
    Member, MembersFilteredRequest, MembersResponse, MonitorRequest, NodeResponse, RequestHeader,
    ResponseHeader, RespondRequest, StopRequest, StreamRequest, TagsRequest, AUTH_COMMAND,
    EVENT_COMMAND, FORCE_LEAVE_COMMAND, GET_COORDINATE_COMMAND, HANDSHAKE_COMMAND,
    INSTALL_KEY_COMMAND, JOIN_COMMAND, LEAVE_COMMAND, LIST_KEYS_COMMAND, MAX_IPC_VERSION,
    MEMBERS_COMMAND, MEMBERS_FILTERED_COMMAND, MONITOR_COMMAND, QUERY_COMMAND, QueryRequest,
    REMOVE_KEY_COMMAND, RESPOND_COMMAND, STATS_COMMAND, STOP_COMMAND, STREAM_COMMAND,
    TAGS_COMMAND, USE_KEY_COMMAND,
};

/// Default I/O timeout, used when [`Config::timeout`] is zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body placeholder for commands that carry none.
const NO_BODY: Option<&()> = None;

/// Configuration for [`RpcClient::from_config`].
#[derive(Debug, Clone)]
pub struct Config {
    /// RPC address of the agent, `host:port`.
    pub addr: String,
    /// Shared key for authentication. `None` or empty skips auth.
    pub auth_key: Option<String>,
    /// Timeout for dialing, writes, and subscription initialization.
    /// Zero falls back to [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

impl Config {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            auth_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Opaque handle to an open subscription, accepted by [`RpcClient::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

/// Settings for [`RpcClient::query`].
///
/// The ack and response channels are created and sized by the caller;
/// sends never block, and records that do not fit are dropped. Both
/// channels are closed when the query finishes.
#[derive(Debug, Default)]
pub struct QueryParams {
    /// Node names to restrict the query to.
    pub filter_nodes: Vec<String>,
    /// Tag name to regex filters.
    pub filter_tags: HashMap<String, String>,
    /// Whether nodes should ack receipt.
    pub request_ack: bool,
    /// Duplicate responses relayed back for redundancy.
    pub relay_factor: u8,
    /// Maximum query duration; also caps the init wait when lower than
    /// the configured timeout. `None` lets the agent choose.
    pub timeout: Option<Duration>,
    /// Opaque query name.
    pub name: String,
    /// Opaque query payload.
    pub payload: Vec<u8>,
    /// Receives the name of each acking node.
    pub ack_tx: Option<mpsc::Sender<String>>,
    /// Receives each node's response.
    pub resp_tx: Option<mpsc::Sender<NodeResponse>>,
}

/// Client for the meshd agent's RPC channel.
///
/// Cheap to clone; all clones share one connection. Safe to use from
/// any number of tasks concurrently.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

struct ClientInner {
    seq: AtomicU64,
    timeout: Duration,
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    dispatch: DispatchTable,
    shutdown: AtomicBool,
    token: CancellationToken,
}

impl RpcClient {
    /// Connect to the agent at `addr` with default settings.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::from_config(Config::new(addr)).await
    }

    /// Connect, handshake, and (when a key is configured) authenticate.
    ///
    /// Any failure after the connection is established closes the client
    /// before the error is returned.
    pub async fn from_config(config: Config) -> Result<Self> {
        let timeout = config.effective_timeout();

        let stream = match time::timeout(timeout, TcpStream::connect(&config.addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "dial timeout",
                )))
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(ClientInner {
            seq: AtomicU64::new(0),
            timeout,
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            dispatch: DispatchTable::new(),
            shutdown: AtomicBool::new(false),
            token: CancellationToken::new(),
        });
        tokio::spawn(read_loop(inner.clone(), StreamDecoder::new(read_half)));

        let client = Self { inner };

        if let Err(err) = client.handshake().await {
            let _ = client.close().await;
            return Err(err);
        }
        if let Some(key) = config.auth_key.as_deref().filter(|key| !key.is_empty()) {
            if let Err(err) = client.auth(key).await {
                let _ = client.close().await;
                return Err(err);
            }
        }

        Ok(client)
    }

    /// Whether the client has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shut the client down: drain every registered handler and close
    /// the connection. Idempotent and safe from any task; pending calls
    /// fail with client-closed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    /// Ask the agent to join the cluster via the given addresses.
    /// Returns the number of nodes successfully joined.
    pub async fn join(&self, existing: &[String], replay: bool) -> Result<usize> {
        let req = JoinRequest {
            existing: existing.to_vec(),
            replay,
        };
        let resp: JoinResponse = self.call(JOIN_COMMAND, Some(&req)).await?;
        Ok(resp.num as usize)
    }

    /// Fetch the list of known members.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let resp: MembersResponse = self.call(MEMBERS_COMMAND, NO_BODY).await?;
        Ok(resp.members)
    }

    /// Fetch members matching the given tag regexes, status regex, and
    /// name regex. Empty filters match everything.
    pub async fn members_filtered(
        &self,
        tags: HashMap<String, String>,
        status: &str,
        name: &str,
    ) -> Result<Vec<Member>> {
        let req = MembersFilteredRequest {
            tags,
            status: status.to_string(),
            name: name.to_string(),
        };
        let resp: MembersResponse = self.call(MEMBERS_FILTERED_COMMAND, Some(&req)).await?;
        Ok(resp.members)
    }

    /// Send a user event into the cluster.
    pub async fn user_event(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        let req = EventRequest {
            name: name.to_string(),
            payload: ByteBuf::from(payload),
            coalesce,
        };
        self.notify(EVENT_COMMAND, Some(&req)).await
    }

    /// Trigger a graceful leave and shutdown of the agent.
    pub async fn leave(&self) -> Result<()> {
        self.notify(LEAVE_COMMAND, NO_BODY).await
    }

    /// Ask the agent to evict a failed node.
    pub async fn force_leave(&self, node: &str) -> Result<()> {
        let req = ForceLeaveRequest {
            node: node.to_string(),
            prune: false,
        };
        self.notify(FORCE_LEAVE_COMMAND, Some(&req)).await
    }

    /// Like [`force_leave`](Self::force_leave), but also reaps the node
    /// from the member list entirely.
    pub async fn force_leave_prune(&self, node: &str) -> Result<()> {
        let req = ForceLeaveRequest {
            node: node.to_string(),
            prune: true,
        };
        self.notify(FORCE_LEAVE_COMMAND, Some(&req)).await
    }

    /// Modify the tags of the running agent.
    pub async fn update_tags(
        &self,
        tags: HashMap<String, String>,
        delete_tags: &[String],
    ) -> Result<()> {
        let req = TagsRequest {
            tags,
            delete_tags: delete_tags.to_vec(),
        };
        self.notify(TAGS_COMMAND, Some(&req)).await
    }

    /// Respond to a query event received on an event stream. `id` is the
    /// query's identifier from the event record.
    pub async fn respond(&self, id: u64, payload: Vec<u8>) -> Result<()> {
        let req = RespondRequest {
            id,
            payload: ByteBuf::from(payload),
        };
        self.notify(RESPOND_COMMAND, Some(&req)).await
    }

    /// Install a new encryption key onto the cluster keyring. Returns
    /// per-node messages for nodes that reported a problem.
    pub async fn install_key(&self, key: &str) -> Result<HashMap<String, String>> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: KeyResponse = self.call(INSTALL_KEY_COMMAND, Some(&req)).await?;
        Ok(resp.messages)
    }

    /// Change the primary encryption key.
    pub async fn use_key(&self, key: &str) -> Result<HashMap<String, String>> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: KeyResponse = self.call(USE_KEY_COMMAND, Some(&req)).await?;
        Ok(resp.messages)
    }

    /// Remove a key from the cluster keyring.
    pub async fn remove_key(&self, key: &str) -> Result<HashMap<String, String>> {
        let req = KeyRequest {
            key: key.to_string(),
        };
        let resp: KeyResponse = self.call(REMOVE_KEY_COMMAND, Some(&req)).await?;
        Ok(resp.messages)
    }

    /// List the keys active on each member of the cluster.
    pub async fn list_keys(&self) -> Result<KeyResponse> {
        self.call(LIST_KEYS_COMMAND, NO_BODY).await
    }

    /// Fetch debugging state information from the agent.
    pub async fn stats(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        self.call(STATS_COMMAND, NO_BODY).await
    }

    /// Retrieve the cached network coordinate of a node, if the agent
    /// has one.
    pub async fn get_coordinate(&self, node: &str) -> Result<Option<Coordinate>> {
        let req = CoordinateRequest {
            node: node.to_string(),
        };
        let resp: CoordinateResponse = self.call(GET_COORDINATE_COMMAND, Some(&req)).await?;
        if resp.ok {
            Ok(Some(resp.coord))
        } else {
            Ok(None)
        }
    }

    /// Subscribe to the agent's logs at the given level. Lines are
    /// delivered on `log_tx`, which the caller creates and sizes; lines
    /// that do not fit are dropped.
    pub async fn monitor(
        &self,
        log_level: &str,
        log_tx: mpsc::Sender<String>,
    ) -> Result<StreamHandle> {
        let req = MonitorRequest {
            log_level: log_level.to_string(),
        };
        let (handler, init_rx) = SeqHandler::monitor(log_tx);
        self.open_subscription(MONITOR_COMMAND, &req, handler, init_rx, self.inner.timeout)
            .await
    }

    /// Subscribe to cluster events matching `filter` (for example
    /// `"*"`, `"user"`, or `"member-join,member-leave"`). Records are
    /// delivered on `event_tx` with the same drop-on-full policy as
    /// [`monitor`](Self::monitor).
    pub async fn stream(
        &self,
        filter: &str,
        event_tx: mpsc::Sender<EventRecord>,
    ) -> Result<StreamHandle> {
        let req = StreamRequest {
            filter: filter.to_string(),
        };
        let (handler, init_rx) = SeqHandler::stream(event_tx);
        self.open_subscription(STREAM_COMMAND, &req, handler, init_rx, self.inner.timeout)
            .await
    }

    /// Start a query and stream acks and responses over the channels in
    /// `params`. The subscription ends when the agent sends its terminal
    /// record, at which point both channels are closed.
    pub async fn query(&self, params: QueryParams) -> Result<StreamHandle> {
        // The init wait honors the caller's query timeout when it is
        // tighter than the configured one.
        let init_timeout = match params.timeout {
            Some(timeout) if !timeout.is_zero() && timeout < self.inner.timeout => timeout,
            _ => self.inner.timeout,
        };
        let req = QueryRequest {
            filter_nodes: params.filter_nodes,
            filter_tags: params.filter_tags,
            request_ack: params.request_ack,
            relay_factor: params.relay_factor,
            timeout: params
                .timeout
                .map(|timeout| timeout.as_nanos() as i64)
                .unwrap_or(0),
            name: params.name,
            payload: ByteBuf::from(params.payload),
        };
        let (handler, init_rx) = SeqHandler::query(params.ack_tx, params.resp_tx);
        self.open_subscription(QUERY_COMMAND, &req, handler, init_rx, init_timeout)
            .await
    }

    /// Unsubscribe from a log monitor, event stream, or query.
    ///
    /// The local handler is deregistered first, so records already in
    /// flight are dropped; the agent is then told to release its side.
    /// Stopping an already-stopped handle leaves local state unchanged.
    pub async fn stop(&self, handle: StreamHandle) -> Result<()> {
        self.inner.dispatch.deregister(handle.0);

        let req = StopRequest { stop: handle.0 };
        self.notify(STOP_COMMAND, Some(&req)).await
    }

    async fn handshake(&self) -> Result<()> {
        let req = HandshakeRequest {
            version: MAX_IPC_VERSION,
        };
        self.notify(HANDSHAKE_COMMAND, Some(&req)).await
    }

    async fn auth(&self, auth_key: &str) -> Result<()> {
        let req = AuthRequest {
            auth_key: auth_key.to_string(),
        };
        self.notify(AUTH_COMMAND, Some(&req)).await
    }

    /// One-shot call returning a typed response body.
    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        command: &'static str,
        body: Option<&Req>,
    ) -> Result<Resp> {
        let value = self
            .generic_rpc(command, body, true)
            .await?
            .unwrap_or(rmpv::Value::Nil);
        Ok(rmpv::ext::from_value(value)?)
    }

    /// One-shot call whose response carries no body.
    async fn notify<Req: Serialize>(&self, command: &'static str, body: Option<&Req>) -> Result<()> {
        self.generic_rpc(command, body, false).await.map(|_| ())
    }

    /// Send one request and wait for its single response frame.
    ///
    /// There is no per-call timeout past the write deadline: a hung
    /// agent keeps the caller waiting until shutdown.
    async fn generic_rpc<Req: Serialize>(
        &self,
        command: &'static str,
        body: Option<&Req>,
        expect_body: bool,
    ) -> Result<Option<rmpv::Value>> {
        let body = body.map(codec::encode_named).transpose()?;
        let seq = self.inner.next_seq();
        let header = RequestHeader::new(command, seq);

        // Register before sending, or the reader loop could see the
        // reply before the handler exists.
        let (handler, result_rx) = SeqHandler::callback(expect_body);
        self.inner.dispatch.register(seq, handler);

        if let Err(err) = self.inner.send_frame(&header, body).await {
            self.inner.dispatch.deregister(seq);
            return Err(err);
        }

        let result = tokio::select! {
            result = result_rx => result.unwrap_or(Err(RpcError::ClientClosed)),
            _ = self.inner.token.cancelled() => Err(RpcError::ClientClosed),
        };
        self.inner.dispatch.deregister(seq);
        result
    }

    async fn open_subscription<Req: Serialize>(
        &self,
        command: &'static str,
        req: &Req,
        handler: Arc<SeqHandler>,
        init_rx: InitWaiter,
        init_timeout: Duration,
    ) -> Result<StreamHandle> {
        let body = codec::encode_named(req)?;
        let seq = self.inner.next_seq();
        let header = RequestHeader::new(command, seq);

        self.inner.dispatch.register(seq, handler);

        if let Err(err) = self.inner.send_frame(&header, Some(body)).await {
            self.inner.dispatch.deregister(seq);
            return Err(err);
        }

        tokio::select! {
            init = init_rx => match init.unwrap_or(Err(RpcError::StreamClosed)) {
                Ok(()) => Ok(StreamHandle(seq)),
                Err(err) => {
                    // An errored initial reply means no records follow;
                    // release the sequence instead of leaving it parked
                    // until close.
                    self.inner.dispatch.deregister(seq);
                    Err(err)
                }
            },
            _ = self.inner.token.cancelled() => {
                self.inner.dispatch.deregister(seq);
                Err(RpcError::ClientClosed)
            }
            _ = time::sleep(init_timeout) => {
                self.inner.dispatch.deregister(seq);
                Err(RpcError::RequestTimeout)
            }
        }
    }
}

impl ClientInner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Write one header (and optional body) as a single flushed message.
    /// The mutex keeps concurrent messages from interleaving on the wire.
    async fn send_frame(&self, header: &RequestHeader, body: Option<Vec<u8>>) -> Result<()> {
        let mut frame = codec::encode_named(header)?;
        if let Some(body) = body {
            frame.extend_from_slice(&body);
        }

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(RpcError::ClientClosed);
        }

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match time::timeout(self.timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RpcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();
        self.dispatch.drain();

        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Single consumer of the inbound stream. Decodes response headers and
/// hands control to the registered handler for the body, inline, so that
/// header-then-body framing needs no length prefix.
async fn read_loop(inner: Arc<ClientInner>, mut dec: StreamDecoder<OwnedReadHalf>) {
    tokio::select! {
        _ = inner.token.cancelled() => {}
        _ = pump(&inner, &mut dec) => {}
    }
    if let Err(err) = inner.close().await {
        debug!(error = %err, "transport close after reader exit");
    }
}

async fn pump(inner: &ClientInner, dec: &mut StreamDecoder<OwnedReadHalf>) {
    loop {
        let header: ResponseHeader = match dec.decode().await {
            Ok(header) => header,
            Err(err) => {
                if !inner.is_closed() {
                    match err {
                        RpcError::ConnectionClosed => debug!("agent closed the connection"),
                        err => error!(error = %err, "failed to decode response header"),
                    }
                }
                return;
            }
        };

        match inner.dispatch.lookup(header.seq) {
            Some(handler) => {
                if handler.handle(&header, dec).await == Control::Deregister {
                    inner.dispatch.deregister(header.seq);
                }
            }
            // The request was cancelled or timed out; drop the frame.
            None => trace!(seq = header.seq, "no handler for sequence, discarding"),
        }
    }
}
