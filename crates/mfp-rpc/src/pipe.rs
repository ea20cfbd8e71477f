//! Duplex request pipe.
//!
//! Wraps one end of a bidirectional byte channel connecting exactly two
//! processes and correlates calls with their responses.
//!
//! # Correlation
//!
//! Each endpoint allocates request ids from its own counter and tags what it
//! submits with its role as `origin`. An inbound `Request` whose origin is our
//! role can only be a reply to something we submitted: it is matched against
//! the pending table, or dropped when no slot is waiting for it (stale or
//! duplicate). The peer's origin marks a fresh call; any other origin is
//! dropped as malformed.
//!
//! # Waiting
//!
//! Every pending slot owns a oneshot sender. A caller awaits only its own
//! receiver, so delivering one response never wakes unrelated callers.
//! `finish()` fails every slot still pending with `PeerLost`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::request::{PeerId, Request, RequestId, RequestState, Role, Signal};
use crate::shutdown::ShutdownSignal;
use crate::wire::{write_frame, FrameReader, WireMessage};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FinishCallback = Box<dyn FnOnce() + Send>;

/// Receives fire-and-forget payloads sent with `put_payload`.
pub type PayloadHandler = Arc<dyn Fn(&RequestPipe, &Value) + Send + Sync>;

/// Buffer size of the in-process pipe built by `RequestPipe::pair()`.
const PAIR_BUFFER_SIZE: usize = 64 * 1024;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingEntry {
    request: Request,
    reply: oneshot::Sender<Result<Request>>,
}

/// Handle to a submitted request; pass it to `RequestPipe::wait`.
#[derive(Debug)]
pub struct PendingReply {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<Request>>,
}

impl PendingReply {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Outcome of one bounded read.
#[derive(Debug)]
pub enum Polled {
    Message(WireMessage),
    /// Nothing arrived before the timeout.
    Empty,
    /// The peer closed the pipe or it broke.
    Closed,
}

/// What `process` made of an inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// A response matched a pending request and its caller was woken.
    Delivered(RequestId),
    /// A response for a request that is no longer pending; dropped.
    Stale(RequestId),
    /// A request tagged with an origin no endpoint uses; dropped.
    Malformed(RequestId),
    /// A call from the peer, in `ResponsePending` state.
    Call(Request),
    /// A fire-and-forget payload.
    Payload(Value),
}

impl Inbound {
    /// True for the `"quit"` sentinel, whether sent as a request or a bare payload.
    pub fn is_quit(&self) -> bool {
        match self {
            Inbound::Call(request) => request.is_quit(),
            Inbound::Payload(value) => value.as_str() == Some("quit"),
            _ => false,
        }
    }
}

/// One end of a duplex request/response channel.
pub struct RequestPipe {
    role: Role,
    peer_id: AtomicU32,
    reader: tokio::sync::Mutex<FrameReader<BoxedReader>>,
    /// `None` once `close()` has released the write side.
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicU64,
    request_timeout: Mutex<Option<Duration>>,
    handler: RwLock<Option<PayloadHandler>>,
    finish_callbacks: Mutex<Vec<FinishCallback>>,
    shutdown: ShutdownSignal,
}

impl RequestPipe {
    /// Wrap a reader/writer pair as the `role` end of a pipe.
    pub fn new<R, W>(role: Role, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            role,
            peer_id: AtomicU32::new(0),
            reader: tokio::sync::Mutex::new(FrameReader::new(Box::new(reader) as BoxedReader)),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer) as BoxedWriter)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout: Mutex::new(None),
            handler: RwLock::new(None),
            finish_callbacks: Mutex::new(Vec::new()),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Two connected ends in one process: `(master, slave)`.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_BUFFER_SIZE);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::new(Role::Master, a_read, a_write),
            Self::new(Role::Slave, b_read, b_write),
        )
    }

    /// The slave end over this process's stdin/stdout.
    pub fn from_stdio() -> Self {
        Self::new(Role::Slave, tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub fn set_peer_id(&self, peer_id: PeerId) {
        self.peer_id.store(peer_id, Ordering::Relaxed);
    }

    pub fn set_request_timeout(&self, timeout: Option<Duration>) {
        *lock(&self.request_timeout) = timeout;
    }

    /// Route non-request payloads to `handler`.
    pub fn set_handler(&self, handler: impl Fn(&RequestPipe, &Value) + Send + Sync + 'static) {
        let mut slot = self.handler.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(Arc::new(handler));
    }

    /// Run `callback` once when the pipe finishes. Runs immediately if it
    /// already has.
    pub fn on_finish(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_finished() {
            callback();
            return;
        }
        lock(&self.finish_callbacks).push(Box::new(callback));
        // finish() may have drained the list between the check and the push.
        if self.is_finished() {
            let late = std::mem::take(&mut *lock(&self.finish_callbacks));
            for callback in late {
                callback();
            }
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn peer_lost(&self) -> RpcError {
        RpcError::PeerLost {
            peer_id: self.peer_id(),
        }
    }

    /// Submit a new request and register it as pending.
    ///
    /// The request must still be `Created`. It receives the next local id and
    /// moves to `Submitted`.
    pub async fn put(&self, mut request: Request) -> Result<PendingReply> {
        if self.is_finished() {
            return Err(self.peer_lost());
        }
        if request.state() != RequestState::Created {
            return Err(RpcError::InvalidState {
                from: request.state(),
                to: RequestState::Submitted,
            });
        }

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        request.assign_id(request_id);
        request.advance(RequestState::Submitted)?;

        let frame = WireMessage::Request {
            request_id,
            payload: request.payload().clone(),
            response: None,
            origin: self.role.origin(),
        }
        .encode()?;

        // Register before writing so a fast reply always finds its slot.
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, PendingEntry { request, reply: tx });
        if self.is_finished() {
            lock(&self.pending).remove(&request_id);
            return Err(self.peer_lost());
        }

        if let Err(e) = self.send(&frame).await {
            lock(&self.pending).remove(&request_id);
            return Err(e);
        }

        debug!("Submitted request {} to peer {}", request_id, self.peer_id());
        Ok(PendingReply { request_id, rx })
    }

    /// Send an answered incoming request back to the peer that submitted it.
    pub async fn respond(&self, request: &Request) -> Result<()> {
        let request_id = request.request_id().ok_or_else(|| RpcError::InvalidParams {
            message: "cannot respond to a request without an id".to_string(),
        })?;

        let frame = WireMessage::Request {
            request_id,
            payload: request.payload().clone(),
            response: request.response().cloned(),
            origin: self.role.peer().origin(),
        }
        .encode()?;

        self.send(&frame).await
    }

    /// Submit a request that expects no reply. Nothing is left pending.
    pub async fn notify(&self, mut request: Request) -> Result<RequestId> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        request.assign_id(request_id);
        request.advance(RequestState::Submitted)?;

        let frame = WireMessage::Request {
            request_id,
            payload: request.payload().clone(),
            response: None,
            origin: self.role.origin(),
        }
        .encode()?;

        self.send(&frame).await?;
        Ok(request_id)
    }

    /// Send a raw value to the peer's out-of-band handler.
    pub async fn put_payload(&self, payload: Value) -> Result<()> {
        let frame = WireMessage::Payload { payload }.encode()?;
        self.send(&frame).await
    }

    /// Ask the peer's consumer pool to stop.
    pub async fn send_quit(&self) -> Result<()> {
        self.put_payload(serde_json::to_value(Signal::Quit)?).await
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(self.peer_lost());
        };
        match write_frame(writer, frame).await {
            Ok(()) => Ok(()),
            Err(RpcError::Io { message, .. }) => {
                warn!("Write to peer {} failed: {}", self.peer_id(), message);
                Err(self.peer_lost())
            }
            Err(e) => Err(e),
        }
    }

    /// Read one message, waiting at most `timeout` (forever when `None`).
    ///
    /// A broken or closed channel is reported as `Polled::Closed`, not as an
    /// error. Errors are left for frames that arrived but cannot be used.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Polled> {
        let read = async {
            let mut reader = self.reader.lock().await;
            reader.next_frame().await
        };

        let next = match timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(next) => next,
                Err(_) => return Ok(Polled::Empty),
            },
            None => read.await,
        };

        match next {
            Ok(Some(frame)) => Ok(Polled::Message(WireMessage::decode(&frame)?)),
            Ok(None) => Ok(Polled::Closed),
            Err(RpcError::Io { message, .. }) => {
                debug!("Pipe to peer {} broke: {}", self.peer_id(), message);
                Ok(Polled::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for the response to a submitted request.
    pub async fn wait(&self, reply: PendingReply) -> Result<Request> {
        let PendingReply { request_id, rx } = reply;
        let timeout = *lock(&self.request_timeout);

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.pending).remove(&request_id);
                    warn!("Request {} to peer {} timed out", request_id, self.peer_id());
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(self.peer_lost()),
        }
    }

    /// Correlate one inbound message.
    pub fn process(&self, message: WireMessage) -> Inbound {
        match message {
            WireMessage::Request {
                request_id,
                payload,
                response,
                origin,
            } => {
                match Role::from_origin(origin) {
                    Some(role) if role == self.role => {}
                    Some(_) => return Inbound::Call(Request::incoming(request_id, payload)),
                    None => {
                        warn!(
                            "Dropping request {} with unknown origin {}",
                            request_id, origin
                        );
                        return Inbound::Malformed(request_id);
                    }
                }

                let entry = lock(&self.pending).remove(&request_id);
                let Some(PendingEntry { mut request, reply }) = entry else {
                    debug!(
                        "Dropping response for request {} (not pending)",
                        request_id
                    );
                    return Inbound::Stale(request_id);
                };

                request.replace_payload(payload);
                match response {
                    Some(response) => {
                        if let Err(e) = request.set_response(response) {
                            warn!("Request {}: {}", request_id, e);
                        }
                    }
                    None => warn!("Reply to request {} carried no response", request_id),
                }
                if let Err(e) = request.advance(RequestState::ResponseReceived) {
                    warn!("Request {}: {}", request_id, e);
                }
                if let Some(callback) = request.take_callback() {
                    callback(&request);
                }
                if reply.send(Ok(request)).is_err() {
                    debug!("Caller for request {} stopped waiting", request_id);
                }
                Inbound::Delivered(request_id)
            }
            WireMessage::Payload { payload } => {
                // The quit sentinel is for the consumer pool, not the handler.
                if payload.as_str() == Some("quit") {
                    return Inbound::Payload(payload);
                }
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                if let Some(handler) = handler {
                    handler(self, &payload);
                }
                Inbound::Payload(payload)
            }
        }
    }

    /// Tear the pipe down. Idempotent: returns `false` if it already finished.
    ///
    /// Stops consumer workers, fails all pending callers with `PeerLost`,
    /// then runs finish callbacks.
    pub fn finish(&self) -> bool {
        if !self.shutdown.trigger() {
            return false;
        }

        let drained: Vec<PendingEntry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            info!(
                "Failing {} pending requests to peer {}",
                drained.len(),
                self.peer_id()
            );
        }
        for entry in drained {
            let _ = entry.reply.send(Err(self.peer_lost()));
        }

        let callbacks = std::mem::take(&mut *lock(&self.finish_callbacks));
        for callback in callbacks {
            callback();
        }

        info!("Pipe to peer {} finished ({})", self.peer_id(), self.role);
        true
    }

    /// Finish and close the write side so the peer sees end-of-stream.
    ///
    /// The writer is dropped as well as shut down: child stdin and process
    /// stdout only flush on shutdown and release the fd on drop. Later
    /// sends fail with `PeerLost`.
    pub async fn close(&self) {
        self.finish();
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        if let Err(e) = writer.shutdown().await {
            debug!("Closing pipe to peer {}: {}", self.peer_id(), e);
        }
        drop(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Payload, Response, Status};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn next_message(pipe: &RequestPipe) -> WireMessage {
        match pipe.get(Some(Duration::from_secs(1))).await.unwrap() {
            Polled::Message(msg) => msg,
            other => panic!("Expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_registers_pending() {
        let (master, _slave) = RequestPipe::pair();
        let reply = master.put(Request::new("call", json!({}))).await.unwrap();

        assert_eq!(reply.request_id(), 1);
        assert_eq!(master.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_submitted_request() {
        let (master, _slave) = RequestPipe::pair();
        let mut req = Request::new("call", json!({}));
        req.advance(RequestState::Submitted).unwrap();

        let result = master.put(req).await;
        assert!(matches!(result, Err(RpcError::InvalidState { .. })));
        assert_eq!(master.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (master, slave) = RequestPipe::pair();
        let reply = master
            .put(Request::new("call", json!({"func": "getparam"})))
            .await
            .unwrap();

        let mut incoming = match slave.process(next_message(&slave).await) {
            Inbound::Call(req) => req,
            other => panic!("Expected Call, got {:?}", other),
        };
        assert_eq!(incoming.state(), RequestState::ResponsePending);
        assert_eq!(incoming.method(), Some("call"));

        incoming
            .set_response(Response::new(Status::MethodOk, json!(440)))
            .unwrap();
        incoming.advance(RequestState::ResponseDone).unwrap();
        slave.respond(&incoming).await.unwrap();

        let inbound = master.process(next_message(&master).await);
        assert!(matches!(inbound, Inbound::Delivered(1)));

        let done = master.wait(reply).await.unwrap();
        assert_eq!(done.state(), RequestState::ResponseReceived);
        assert_eq!(
            done.response(),
            Some(&Response::new(Status::MethodOk, json!(440)))
        );
        assert_eq!(master.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let (master, _slave) = RequestPipe::pair();
        let reply = master.put(Request::new("call", json!({}))).await.unwrap();

        let answer = WireMessage::Request {
            request_id: reply.request_id(),
            payload: Payload::call("call", json!({})),
            response: Some(Response::new(Status::MethodOk, json!(1))),
            origin: Role::Master.origin(),
        };

        assert!(matches!(master.process(answer.clone()), Inbound::Delivered(_)));
        assert!(matches!(master.process(answer), Inbound::Stale(_)));

        let done = master.wait(reply).await.unwrap();
        assert_eq!(done.response().unwrap().value(), &json!(1));
    }

    #[tokio::test]
    async fn test_peer_origin_is_a_fresh_call() {
        let (master, _slave) = RequestPipe::pair();
        let reply = master.put(Request::new("call", json!({}))).await.unwrap();

        // Same id, but submitted by the slave: not our reply.
        let call = WireMessage::Request {
            request_id: reply.request_id(),
            payload: Payload::call("create", json!({})),
            response: None,
            origin: Role::Slave.origin(),
        };
        assert!(matches!(master.process(call), Inbound::Call(_)));
        assert_eq!(master.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_callback_runs_on_delivery() {
        let (master, _slave) = RequestPipe::pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let req = Request::new("call", json!({})).on_response(move |r| {
            assert_eq!(r.state(), RequestState::ResponseReceived);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let reply = master.put(req).await.unwrap();

        master.process(WireMessage::Request {
            request_id: reply.request_id(),
            payload: Payload::call("call", json!({})),
            response: Some(Response::new(Status::Ack, Value::Null)),
            origin: 1,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payload_goes_to_handler() {
        let (master, slave) = RequestPipe::pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slave.set_handler(move |_, value| lock(&sink).push(value.clone()));

        master.put_payload(json!({"midi": [144, 60, 100]})).await.unwrap();
        let inbound = slave.process(next_message(&slave).await);

        assert!(matches!(inbound, Inbound::Payload(_)));
        assert_eq!(lock(&seen).as_slice(), &[json!({"midi": [144, 60, 100]})]);
    }

    #[tokio::test]
    async fn test_quit_sentinel_detected() {
        let (master, slave) = RequestPipe::pair();
        master.send_quit().await.unwrap();
        assert!(slave.process(next_message(&slave).await).is_quit());

        master.notify(Request::quit()).await.unwrap();
        assert!(slave.process(next_message(&slave).await).is_quit());
    }

    #[tokio::test]
    async fn test_get_times_out_empty() {
        let (master, _slave) = RequestPipe::pair();
        let polled = master.get(Some(Duration::from_millis(10))).await.unwrap();
        assert!(matches!(polled, Polled::Empty));
    }

    #[tokio::test]
    async fn test_get_reports_closed() {
        let (master, slave) = RequestPipe::pair();
        slave.close().await;
        drop(slave);
        let polled = master.get(Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(polled, Polled::Closed));
    }

    #[tokio::test]
    async fn test_finish_fails_waiters_and_runs_callbacks_once() {
        let (master, _slave) = RequestPipe::pair();
        master.set_peer_id(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        master.on_finish(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let reply = master.put(Request::new("call", json!({}))).await.unwrap();
        assert!(master.finish());
        assert!(!master.finish());

        let result = master.wait(reply).await;
        assert!(matches!(result, Err(RpcError::PeerLost { peer_id: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(master.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_put_after_finish_fails() {
        let (master, _slave) = RequestPipe::pair();
        master.finish();
        let result = master.put(Request::new("call", json!({}))).await;
        assert!(matches!(result, Err(RpcError::PeerLost { .. })));
    }

    #[tokio::test]
    async fn test_wait_timeout_frees_slot() {
        let (master, _slave) = RequestPipe::pair();
        master.set_request_timeout(Some(Duration::from_millis(20)));
        let reply = master.put(Request::new("call", json!({}))).await.unwrap();

        let request_id = reply.request_id();

        let result = master.wait(reply).await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
        assert_eq!(master.pending_count(), 0);

        // The reply shows up after the caller gave up.
        let late = WireMessage::Request {
            request_id,
            payload: Payload::call("call", json!({})),
            response: Some(Response::new(Status::MethodOk, json!(1))),
            origin: Role::Master.origin(),
        };
        assert!(matches!(master.process(late), Inbound::Stale(id) if id == request_id));
    }

    #[tokio::test]
    async fn test_unknown_origin_is_dropped() {
        let (master, _slave) = RequestPipe::pair();
        let reply = master.put(Request::new("call", json!({}))).await.unwrap();

        let garbled = WireMessage::Request {
            request_id: reply.request_id(),
            payload: Payload::call("create", json!({})),
            response: None,
            origin: 7,
        };
        assert!(matches!(master.process(garbled), Inbound::Malformed(1)));
        assert_eq!(master.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_quit_payload_skips_handler() {
        let (master, slave) = RequestPipe::pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        slave.set_handler(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        master.send_quit().await.unwrap();
        let inbound = slave.process(next_message(&slave).await);
        assert!(inbound.is_quit());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (master, slave) = RequestPipe::pair();
        master.close().await;
        master.close().await;

        let result = master.put_payload(json!("late")).await;
        assert!(matches!(result, Err(RpcError::PeerLost { .. })));
        let polled = slave.get(Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(polled, Polled::Closed));
    }
}
