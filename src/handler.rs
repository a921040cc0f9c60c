//! Per-sequence response handlers.
//!
//! Every in-flight request registers a handler under its sequence
//! number. The reader loop invokes [`SeqHandler::handle`] inline for
//! each frame tagged with that sequence, lending the handler the shared
//! stream decoder so it can consume the frame's body before the loop
//! resumes decoding the next header. [`SeqHandler::cleanup`] runs
//! exactly once when the sequence is deregistered.
//!
//! Handlers never call back into the client. When one needs its own
//! sequence deregistered (terminal query record, body decode failure),
//! `handle` returns [`Control::Deregister`] and the reader loop performs
//! the removal after the handler has returned. By then every handler
//! lock is released, so cleanup can safely re-acquire it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::codec::StreamDecoder;
use crate::error::{Result, RpcError};
use crate::protocol::{
    EventRecord, LogRecord, NodeResponse, QueryRecord, ResponseHeader, AUTH_REQUIRED,
    QUERY_RECORD_ACK, QUERY_RECORD_DONE, QUERY_RECORD_RESPONSE,
};

/// What the reader loop should do with the sequence after a frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Keep,
    Deregister,
}

/// Outcome of a one-shot call: the type-erased response body on success.
pub(crate) type CallResult = Result<Option<rmpv::Value>>;

/// Receiving side of a subscription's init-waiter.
pub(crate) type InitWaiter = oneshot::Receiver<Result<()>>;

/// Handler registered in the dispatch table for one sequence.
pub(crate) enum SeqHandler {
    Callback(CallbackHandler),
    Monitor(MonitorHandler),
    Stream(StreamHandler),
    Query(QueryHandler),
}

impl SeqHandler {
    /// Handler for a one-shot call. `expect_body` is true when the
    /// command's success response carries a body.
    pub(crate) fn callback(expect_body: bool) -> (Arc<Self>, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let handler = Self::Callback(CallbackHandler {
            expect_body,
            tx: Mutex::new(Some(tx)),
        });
        (Arc::new(handler), rx)
    }

    /// Handler for a log monitor subscription.
    pub(crate) fn monitor(log_tx: mpsc::Sender<String>) -> (Arc<Self>, InitWaiter) {
        let (gate, rx) = InitGate::new();
        let handler = Self::Monitor(MonitorHandler {
            gate,
            state: Mutex::new(Delivery::new(log_tx)),
        });
        (Arc::new(handler), rx)
    }

    /// Handler for an event stream subscription.
    pub(crate) fn stream(event_tx: mpsc::Sender<EventRecord>) -> (Arc<Self>, InitWaiter) {
        let (gate, rx) = InitGate::new();
        let handler = Self::Stream(StreamHandler {
            gate,
            state: Mutex::new(Delivery::new(event_tx)),
        });
        (Arc::new(handler), rx)
    }

    /// Handler for a query subscription.
    pub(crate) fn query(
        ack_tx: Option<mpsc::Sender<String>>,
        resp_tx: Option<mpsc::Sender<NodeResponse>>,
    ) -> (Arc<Self>, InitWaiter) {
        let (gate, rx) = InitGate::new();
        let handler = Self::Query(QueryHandler {
            gate,
            state: Mutex::new(QueryDelivery {
                closed: false,
                ack_tx,
                resp_tx,
            }),
        });
        (Arc::new(handler), rx)
    }

    /// Process one inbound frame for this sequence. Runs inline on the
    /// reader task; may consume a body from the decoder.
    pub(crate) async fn handle<R: AsyncRead + Unpin>(
        &self,
        header: &ResponseHeader,
        dec: &mut StreamDecoder<R>,
    ) -> Control {
        match self {
            Self::Callback(h) => h.handle(header, dec).await,
            Self::Monitor(h) => h.handle(header, dec).await,
            Self::Stream(h) => h.handle(header, dec).await,
            Self::Query(h) => h.handle(header, dec).await,
        }
    }

    /// Release the handler's resources. Idempotent; called by the
    /// dispatch table exactly once per deregistration.
    pub(crate) fn cleanup(&self) {
        match self {
            Self::Callback(h) => h.cleanup(),
            Self::Monitor(h) => h.cleanup(),
            Self::Stream(h) => h.cleanup(),
            Self::Query(h) => h.cleanup(),
        }
    }
}

/// Converts a response header into the result its waiter should see.
fn header_result(header: &ResponseHeader) -> Result<()> {
    if header.error.is_empty() {
        Ok(())
    } else {
        Err(RpcError::Agent(header.error.clone()))
    }
}

/// Once-only latch signaling a subscription's init-waiter.
///
/// The atomic flag decides which path delivers the init value (first
/// response, or cleanup without a response) and makes the other a no-op.
/// It is deliberately independent of the delivery lock.
struct InitGate {
    fired: AtomicBool,
    slot: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl InitGate {
    fn new() -> (Self, InitWaiter) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            fired: AtomicBool::new(false),
            slot: Mutex::new(Some(tx)),
        };
        (gate, rx)
    }

    /// Signal the waiter. Returns true when this call won the race and
    /// delivered the value.
    fn fire(&self, result: Result<()>) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(result);
        }
        true
    }
}

/// Closed flag plus the consumer channel, guarded by one lock.
struct Delivery<T> {
    closed: bool,
    tx: Option<mpsc::Sender<T>>,
}

impl<T> Delivery<T> {
    fn new(tx: mpsc::Sender<T>) -> Self {
        Self {
            closed: false,
            tx: Some(tx),
        }
    }
}

pub(crate) struct CallbackHandler {
    expect_body: bool,
    tx: Mutex<Option<oneshot::Sender<CallResult>>>,
}

impl CallbackHandler {
    async fn handle<R: AsyncRead + Unpin>(
        &self,
        header: &ResponseHeader,
        dec: &mut StreamDecoder<R>,
    ) -> Control {
        // The auth sentinel arrives without a body; touching the decoder
        // here would eat the next frame's header.
        if header.error == AUTH_REQUIRED {
            self.resolve(Err(RpcError::Agent(header.error.clone())));
            return Control::Keep;
        }

        let body = if self.expect_body {
            match dec.decode::<rmpv::Value>().await {
                Ok(value) => Some(value),
                Err(err) => {
                    self.resolve(Err(err));
                    return Control::Deregister;
                }
            }
        } else {
            None
        };

        self.resolve(header_result(header).map(|()| body));
        Control::Keep
    }

    fn resolve(&self, result: CallResult) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn cleanup(&self) {
        // Dropping an unsent sender wakes a still-pending caller; the
        // call primitive maps the closed channel to client-closed.
        self.tx.lock().take();
    }
}

pub(crate) struct MonitorHandler {
    gate: InitGate,
    state: Mutex<Delivery<String>>,
}

impl MonitorHandler {
    async fn handle<R: AsyncRead + Unpin>(
        &self,
        header: &ResponseHeader,
        dec: &mut StreamDecoder<R>,
    ) -> Control {
        if self.gate.fire(header_result(header)) {
            return Control::Keep;
        }

        let record: LogRecord = match dec.decode().await {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to decode log record");
                return Control::Deregister;
            }
        };

        let state = self.state.lock();
        if state.closed {
            warn!("dropping log line, monitor handler closed");
            return Control::Keep;
        }
        if let Some(tx) = &state.tx {
            match tx.try_send(record.log) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => error!("dropping log line, monitor channel full"),
                Err(TrySendError::Closed(_)) => warn!("dropping log line, monitor receiver gone"),
            }
        }
        Control::Keep
    }

    fn cleanup(&self) {
        self.gate.fire(Err(RpcError::StreamClosed));

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.tx = None;
        state.closed = true;
    }
}

pub(crate) struct StreamHandler {
    gate: InitGate,
    state: Mutex<Delivery<EventRecord>>,
}

impl StreamHandler {
    async fn handle<R: AsyncRead + Unpin>(
        &self,
        header: &ResponseHeader,
        dec: &mut StreamDecoder<R>,
    ) -> Control {
        if self.gate.fire(header_result(header)) {
            return Control::Keep;
        }

        let record: EventRecord = match dec.decode().await {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to decode stream record");
                return Control::Deregister;
            }
        };

        let state = self.state.lock();
        if state.closed {
            warn!("dropping stream record, handler closed");
            return Control::Keep;
        }
        if let Some(tx) = &state.tx {
            match tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => error!("dropping event, stream channel full"),
                Err(TrySendError::Closed(_)) => warn!("dropping event, stream receiver gone"),
            }
        }
        Control::Keep
    }

    fn cleanup(&self) {
        self.gate.fire(Err(RpcError::StreamClosed));

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.tx = None;
        state.closed = true;
    }
}

struct QueryDelivery {
    closed: bool,
    ack_tx: Option<mpsc::Sender<String>>,
    resp_tx: Option<mpsc::Sender<NodeResponse>>,
}

pub(crate) struct QueryHandler {
    gate: InitGate,
    state: Mutex<QueryDelivery>,
}

impl QueryHandler {
    async fn handle<R: AsyncRead + Unpin>(
        &self,
        header: &ResponseHeader,
        dec: &mut StreamDecoder<R>,
    ) -> Control {
        if self.gate.fire(header_result(header)) {
            return Control::Keep;
        }

        let record: QueryRecord = match dec.decode().await {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "failed to decode query record");
                return Control::Deregister;
            }
        };

        let state = self.state.lock();
        if state.closed {
            warn!("dropping query record, handler closed");
            return Control::Keep;
        }
        match record.record_type.as_str() {
            QUERY_RECORD_ACK => {
                if let Some(tx) = &state.ack_tx {
                    match tx.try_send(record.from) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            error!("dropping query ack, channel full")
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("dropping query ack, receiver gone")
                        }
                    }
                }
            }
            QUERY_RECORD_RESPONSE => {
                if let Some(tx) = &state.resp_tx {
                    let response = NodeResponse {
                        from: record.from,
                        payload: record.payload.into_vec(),
                    };
                    match tx.try_send(response) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            error!("dropping query response, channel full")
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("dropping query response, receiver gone")
                        }
                    }
                }
            }
            QUERY_RECORD_DONE => {
                // No further records coming. Deregistration runs cleanup,
                // which takes this lock: release it before handing the
                // sequence back to the reader loop for removal.
                drop(state);
                return Control::Deregister;
            }
            other => error!(record_type = other, "unrecognized query record type"),
        }
        Control::Keep
    }

    fn cleanup(&self) {
        self.gate.fire(Err(RpcError::StreamClosed));

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.ack_tx = None;
        state.resp_tx = None;
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_named;
    use serde_bytes::ByteBuf;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn ok_header(seq: u64) -> ResponseHeader {
        ResponseHeader {
            seq,
            error: String::new(),
        }
    }

    async fn decoder_with(bytes: &[u8]) -> StreamDecoder<DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tx.write_all(bytes).await.unwrap();
        StreamDecoder::new(rx)
    }

    #[test]
    fn test_init_gate_fires_once() {
        let (gate, rx) = InitGate::new();

        assert!(gate.fire(Ok(())));
        assert!(!gate.fire(Err(RpcError::StreamClosed)));
        assert!(rx.blocking_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_monitor_init_then_records_in_order() {
        let (log_tx, mut log_rx) = mpsc::channel(8);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        let mut dec = decoder_with(&[]).await;
        assert_eq!(handler.handle(&ok_header(3), &mut dec).await, Control::Keep);
        assert!(init_rx.await.unwrap().is_ok());

        let mut bytes = Vec::new();
        for i in 1..=3 {
            bytes.extend(
                encode_named(&LogRecord {
                    log: format!("line-{i}"),
                })
                .unwrap(),
            );
        }
        let mut dec = decoder_with(&bytes).await;
        for _ in 0..3 {
            assert_eq!(handler.handle(&ok_header(3), &mut dec).await, Control::Keep);
        }

        for i in 1..=3 {
            assert_eq!(log_rx.recv().await.unwrap(), format!("line-{i}"));
        }
    }

    #[tokio::test]
    async fn test_monitor_drops_records_when_channel_full() {
        let (log_tx, mut log_rx) = mpsc::channel(1);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        let mut dec = decoder_with(&[]).await;
        handler.handle(&ok_header(1), &mut dec).await;
        init_rx.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        for i in 1..=3 {
            bytes.extend(
                encode_named(&LogRecord {
                    log: format!("line-{i}"),
                })
                .unwrap(),
            );
        }
        let mut dec = decoder_with(&bytes).await;
        for _ in 0..3 {
            // Must not block, whatever the channel state.
            handler.handle(&ok_header(1), &mut dec).await;
        }

        assert_eq!(log_rx.recv().await.unwrap(), "line-1");
        assert!(log_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_monitor_cleanup_closes_channel_once() {
        let (log_tx, mut log_rx) = mpsc::channel::<String>(1);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        let mut dec = decoder_with(&[]).await;
        handler.handle(&ok_header(1), &mut dec).await;
        init_rx.await.unwrap().unwrap();

        handler.cleanup();
        handler.cleanup();

        assert!(log_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_before_init_signals_stream_closed() {
        let (log_tx, _log_rx) = mpsc::channel::<String>(1);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        handler.cleanup();

        match init_rx.await.unwrap() {
            Err(RpcError::StreamClosed) => {}
            other => panic!("expected stream closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_init_error_goes_to_waiter() {
        let (log_tx, _log_rx) = mpsc::channel::<String>(1);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        let header = ResponseHeader {
            seq: 1,
            error: "no such log level".to_string(),
        };
        let mut dec = decoder_with(&[]).await;
        handler.handle(&header, &mut dec).await;

        match init_rx.await.unwrap() {
            Err(RpcError::Agent(msg)) => assert_eq!(msg, "no such log level"),
            other => panic!("expected agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_monitor_decode_failure_requests_deregistration() {
        let (log_tx, _log_rx) = mpsc::channel::<String>(1);
        let (handler, init_rx) = SeqHandler::monitor(log_tx);

        let mut dec = decoder_with(&[]).await;
        handler.handle(&ok_header(1), &mut dec).await;
        init_rx.await.unwrap().unwrap();

        // A record frame whose body never arrives: the peer hangs up.
        let mut dec = decoder_with(&[]).await;
        assert_eq!(
            handler.handle(&ok_header(1), &mut dec).await,
            Control::Deregister
        );
    }

    #[tokio::test]
    async fn test_query_routes_acks_and_responses() {
        let (ack_tx, mut ack_rx) = mpsc::channel(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(4);
        let (handler, init_rx) = SeqHandler::query(Some(ack_tx), Some(resp_tx));

        let mut dec = decoder_with(&[]).await;
        handler.handle(&ok_header(5), &mut dec).await;
        init_rx.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        bytes.extend(
            encode_named(&QueryRecord {
                record_type: QUERY_RECORD_ACK.to_string(),
                from: "node-a".to_string(),
                payload: ByteBuf::new(),
            })
            .unwrap(),
        );
        bytes.extend(
            encode_named(&QueryRecord {
                record_type: QUERY_RECORD_RESPONSE.to_string(),
                from: "node-a".to_string(),
                payload: ByteBuf::from(b"payload-a".to_vec()),
            })
            .unwrap(),
        );
        bytes.extend(
            encode_named(&QueryRecord {
                record_type: QUERY_RECORD_DONE.to_string(),
                from: String::new(),
                payload: ByteBuf::new(),
            })
            .unwrap(),
        );

        let mut dec = decoder_with(&bytes).await;
        assert_eq!(handler.handle(&ok_header(5), &mut dec).await, Control::Keep);
        assert_eq!(handler.handle(&ok_header(5), &mut dec).await, Control::Keep);
        assert_eq!(
            handler.handle(&ok_header(5), &mut dec).await,
            Control::Deregister
        );

        assert_eq!(ack_rx.recv().await.unwrap(), "node-a");
        let response = resp_rx.recv().await.unwrap();
        assert_eq!(response.from, "node-a");
        assert_eq!(response.payload, b"payload-a");

        handler.cleanup();
        assert!(ack_rx.recv().await.is_none());
        assert!(resp_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_query_ignores_unrecognized_record_type() {
        let (ack_tx, _ack_rx) = mpsc::channel(4);
        let (handler, init_rx) = SeqHandler::query(Some(ack_tx), None);

        let mut dec = decoder_with(&[]).await;
        handler.handle(&ok_header(5), &mut dec).await;
        init_rx.await.unwrap().unwrap();

        let bytes = encode_named(&QueryRecord {
            record_type: "bogus".to_string(),
            from: "node-a".to_string(),
            payload: ByteBuf::new(),
        })
        .unwrap();
        let mut dec = decoder_with(&bytes).await;
        assert_eq!(handler.handle(&ok_header(5), &mut dec).await, Control::Keep);
    }

    #[tokio::test]
    async fn test_callback_auth_sentinel_skips_body() {
        let (handler, rx) = SeqHandler::callback(true);

        let header = ResponseHeader {
            seq: 2,
            error: AUTH_REQUIRED.to_string(),
        };
        // Empty, closed stream: any body read here would fail and the
        // waiter would see the wrong error.
        let mut dec = decoder_with(&[]).await;
        assert_eq!(handler.handle(&header, &mut dec).await, Control::Keep);

        match rx.await.unwrap() {
            Err(RpcError::Agent(msg)) => assert_eq!(msg, AUTH_REQUIRED),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callback_decodes_body_on_success() {
        let (handler, rx) = SeqHandler::callback(true);

        let bytes = encode_named(&LogRecord {
            log: "body".to_string(),
        })
        .unwrap();
        let mut dec = decoder_with(&bytes).await;
        handler.handle(&ok_header(1), &mut dec).await;

        let value = rx.await.unwrap().unwrap().expect("body expected");
        assert!(value.is_map());
    }

    #[tokio::test]
    async fn test_callback_cleanup_wakes_waiter() {
        let (handler, rx) = SeqHandler::callback(false);

        handler.cleanup();
        assert!(rx.await.is_err());
    }
}
