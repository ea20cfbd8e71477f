//! Process-wide RPC runtime.
//!
//! An `RpcHost` owns everything a process needs to take part in the object
//! layer: its class registry, the objects it serves, the publisher table, and
//! one managed pipe (plus consumer pool) per peer. It is cheap to clone and is
//! passed explicitly to whatever creates proxies.
//!
//! Inbound calls are dispatched by `handle`:
//!
//! | method      | params                           | response                         |
//! |-------------|----------------------------------|----------------------------------|
//! | `create`    | `{type, args, kwargs}`           | `(rpcid, null)` or `(NO_CLASS, null)` |
//! | `call`      | `{func, rpcid, args, kwargs}`    | `(METHOD_OK, value)`, `(NO_METHOD, null)`, `(METHOD_FAILED, text)` |
//! | `delete`    | `{rpcid}`                        | `(true, null)`                   |
//! | `publish`   | `{classes}`                      | `(true, null)`                   |
//! | `peer_exit` | `{}`                             | none; the peer is unmanaged      |

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::HostOptions;
use crate::error::{Result, RpcError};
use crate::object::{CallArgs, MethodError, RpcObject};
use crate::pipe::{lock, RequestPipe};
use crate::pool::{ConsumerPool, InboundHandler};
use crate::registry::{CallStats, ClassRegistry, ObjectTable, PublisherTable};
use crate::request::{PeerId, Request, RequestState, Response, RpcId, Status};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

#[derive(Clone)]
struct PeerLink {
    pipe: Arc<RequestPipe>,
    pool: Arc<ConsumerPool>,
}

struct HostInner {
    options: HostOptions,
    classes: RwLock<ClassRegistry>,
    objects: std::sync::Mutex<ObjectTable>,
    publishers: std::sync::Mutex<PublisherTable>,
    publishers_changed: Notify,
    call_stats: std::sync::Mutex<CallStats>,
    peers: std::sync::Mutex<HashMap<PeerId, PeerLink>>,
}

impl HostInner {
    /// A managed pipe finished on its own (end-of-stream, quit, broken write).
    fn pipe_finished(&self, peer_id: PeerId, pipe: *const RequestPipe) {
        let removed = {
            let mut peers = lock(&self.peers);
            match peers.get(&peer_id) {
                Some(link) if std::ptr::eq(Arc::as_ptr(&link.pipe), pipe) => {
                    peers.remove(&peer_id)
                }
                _ => None,
            }
        };

        if removed.is_some() {
            info!("Peer {} departed", peer_id);
            self.forget_publisher(peer_id);
        }
    }

    fn forget_publisher(&self, peer_id: PeerId) {
        let affected = lock(&self.publishers).remove_peer(peer_id);
        if !affected.is_empty() {
            debug!("Peer {} no longer publishes {:?}", peer_id, affected);
            self.publishers_changed.notify_waiters();
        }
    }
}

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "type")]
    class: String,
    #[serde(flatten)]
    args: CallArgs,
}

#[derive(Deserialize)]
struct CallParams {
    func: String,
    rpcid: RpcId,
    #[serde(flatten)]
    args: CallArgs,
}

#[derive(Deserialize)]
struct DeleteParams {
    rpcid: RpcId,
}

#[derive(Deserialize)]
struct PublishParams {
    #[serde(default)]
    classes: Vec<String>,
}

/// Answers calls arriving on one managed pipe.
struct PeerDispatch {
    host: Weak<HostInner>,
    peer_id: PeerId,
}

#[async_trait::async_trait]
impl InboundHandler for PeerDispatch {
    async fn handle_request(&self, pipe: Arc<RequestPipe>, request: Request) {
        let Some(inner) = self.host.upgrade() else {
            debug!("Host gone, dropping request from peer {}", self.peer_id);
            return;
        };
        let host = RpcHost { inner };

        if let Some(answered) = host.handle(request, self.peer_id).await {
            match pipe.respond(&answered).await {
                Ok(()) => {}
                Err(e) if e.is_peer_failure() => {
                    debug!("Peer {} left before its answer: {}", self.peer_id, e)
                }
                Err(e) => warn!("Could not answer peer {}: {}", self.peer_id, e),
            }
        }
    }
}

/// Process-wide RPC runtime. Clones share state.
#[derive(Clone)]
pub struct RpcHost {
    inner: Arc<HostInner>,
}

impl RpcHost {
    pub fn new(options: HostOptions) -> Self {
        Self {
            inner: Arc::new(HostInner {
                options,
                classes: RwLock::new(ClassRegistry::new()),
                objects: std::sync::Mutex::new(ObjectTable::new()),
                publishers: std::sync::Mutex::new(PublisherTable::new()),
                publishers_changed: Notify::new(),
                call_stats: std::sync::Mutex::new(CallStats::default()),
                peers: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    pub fn node_id(&self) -> &str {
        &self.inner.options.node_id
    }

    // ========================================
    // Classes
    // ========================================

    /// Make `name` constructible in this process.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(CallArgs) -> std::result::Result<Arc<dyn RpcObject>, MethodError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        debug!("Registered class {}", name);
        write(&self.inner.classes).register(name, Arc::new(constructor));
    }

    /// Mark whether instances of `name` live in this process.
    pub fn set_local(&self, name: impl Into<String>, local: bool) {
        write(&self.inner.classes).set_local(name, local);
    }

    pub fn is_local(&self, name: &str) -> bool {
        read(&self.inner.classes).is_local(name)
    }

    pub fn class_names(&self) -> Vec<String> {
        read(&self.inner.classes).names()
    }

    // ========================================
    // Peers
    // ========================================

    /// Take ownership of `pipe` as the channel to `peer_id` and start
    /// consuming it.
    ///
    /// When the pipe finishes on its own the peer is dropped and its publisher
    /// entries are forgotten, exactly as for `peer_exit`.
    pub fn manage(&self, peer_id: PeerId, pipe: RequestPipe) -> Arc<RequestPipe> {
        pipe.set_peer_id(peer_id);
        pipe.set_request_timeout(self.inner.options.request_timeout);
        let pipe = Arc::new(pipe);

        let handler = Arc::new(PeerDispatch {
            host: Arc::downgrade(&self.inner),
            peer_id,
        });
        let pool = Arc::new(ConsumerPool::start(
            pipe.clone(),
            self.inner.options.workers,
            handler,
        ));

        let previous = lock(&self.inner.peers).insert(
            peer_id,
            PeerLink {
                pipe: pipe.clone(),
                pool,
            },
        );
        if let Some(old) = previous {
            warn!("Replacing pipe for peer {}", peer_id);
            old.pipe.finish();
        }

        let host = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(&pipe);
        pipe.on_finish(move || {
            if let Some(inner) = host.upgrade() {
                inner.pipe_finished(peer_id, watched.as_ptr());
            }
        });

        info!(
            "{} managing peer {} as {}",
            self.inner.options.node_id,
            peer_id,
            pipe.role()
        );
        pipe
    }

    /// Stop talking to `peer_id`. Returns `false` if it was not managed.
    pub async fn unmanage(&self, peer_id: PeerId) -> bool {
        let link = lock(&self.inner.peers).remove(&peer_id);
        let Some(link) = link else {
            return false;
        };

        self.inner.forget_publisher(peer_id);
        link.pipe.close().await;
        link.pool.join().await;
        info!("Unmanaged peer {}", peer_id);
        true
    }

    pub fn peer(&self, peer_id: PeerId) -> Result<Arc<RequestPipe>> {
        lock(&self.inner.peers)
            .get(&peer_id)
            .map(|link| link.pipe.clone())
            .ok_or(RpcError::UnknownPeer { peer_id })
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.inner.peers).keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Peer a new proxy for `class` should use: `explicit` if given, else the
    /// first publisher of the class, else the configured default peer.
    pub fn resolve_peer(&self, class: &str, explicit: Option<PeerId>) -> PeerId {
        explicit
            .or_else(|| lock(&self.inner.publishers).first(class))
            .unwrap_or(self.inner.options.default_peer)
    }

    /// Send `method(params)` to `peer_id` and wait for its response.
    pub async fn request(&self, peer_id: PeerId, method: &str, params: Value) -> Result<Response> {
        let pipe = self.peer(peer_id)?;
        let reply = pipe.put(Request::new(method, params)).await?;
        let mut done = pipe.wait(reply).await?;
        done.advance(RequestState::ResponseDone)?;
        done.into_response()
            .ok_or_else(|| RpcError::Other(format!("Reply to {} carried no response", method)))
    }

    // ========================================
    // Publishers
    // ========================================

    /// Tell `peer_id` that this process can construct `classes`.
    pub async fn publish(&self, peer_id: PeerId, classes: &[&str]) -> Result<()> {
        let response = self
            .request(peer_id, "publish", json!({ "classes": classes }))
            .await?;
        match response.status() {
            Status::Ack => {
                info!("Published {:?} to peer {}", classes, peer_id);
                Ok(())
            }
            status => Err(RpcError::UnexpectedStatus {
                method: "publish".to_string(),
                status,
            }),
        }
    }

    pub fn publishers(&self, class: &str) -> Vec<PeerId> {
        lock(&self.inner.publishers).publishers(class)
    }

    /// Wait until some peer publishes `class`.
    pub async fn wait_for_publisher(&self, class: &str, timeout: Duration) -> Result<PeerId> {
        let wait = async {
            loop {
                let notified = self.inner.publishers_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let first = lock(&self.inner.publishers).first(class);
                if let Some(peer_id) = first {
                    return peer_id;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RpcError::Timeout(timeout))
    }

    fn add_publishers(&self, peer_id: PeerId, classes: &[String]) {
        {
            let mut publishers = lock(&self.inner.publishers);
            for class in classes {
                publishers.add(class.as_str(), peer_id);
            }
        }
        debug!("Peer {} publishes {:?}", peer_id, classes);
        self.inner.publishers_changed.notify_waiters();
    }

    // ========================================
    // Local objects
    // ========================================

    /// Construct an instance of `class` in this process.
    pub fn create_local(&self, class: &str, args: CallArgs) -> Result<RpcId> {
        let constructor = read(&self.inner.classes)
            .constructor(class)
            .ok_or_else(|| RpcError::ClassNotFound {
                class: class.to_string(),
            })?;

        let object = match std::panic::catch_unwind(AssertUnwindSafe(|| constructor(args))) {
            Ok(Ok(object)) => object,
            Ok(Err(e)) => {
                return Err(RpcError::MethodFailed {
                    method: "create".to_string(),
                    traceback: format!("Constructor for {} failed\n{}", class, e),
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Constructor for {} panicked: {}", class, message);
                return Err(RpcError::MethodFailed {
                    method: "create".to_string(),
                    traceback: format!("Constructor for {} panicked\n{}", class, message),
                });
            }
        };

        let rpcid = lock(&self.inner.objects).insert(object);
        debug!("Created {} as rpcid {}", class, rpcid);
        Ok(rpcid)
    }

    /// Run `method` on the local object `rpcid`.
    ///
    /// A failing or panicking method body becomes `MethodFailed` carrying a
    /// diagnostic that names the call.
    pub async fn call_local(&self, rpcid: RpcId, method: &str, args: CallArgs) -> Result<Value> {
        let object = lock(&self.inner.objects).get(rpcid);
        let Some(object) = object else {
            return Err(RpcError::MethodNotFound {
                method: method.to_string(),
                rpcid,
            });
        };
        lock(&self.inner.call_stats).record(method);

        let outcome = AssertUnwindSafe(object.call_method(method, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(MethodError::NotFound(_))) => Err(RpcError::MethodNotFound {
                method: method.to_string(),
                rpcid,
            }),
            Ok(Err(MethodError::Failed(text))) => Err(RpcError::MethodFailed {
                method: method.to_string(),
                traceback: self.diagnostic(rpcid, method, &text),
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Method {} on rpcid {} panicked: {}", method, rpcid, message);
                Err(RpcError::MethodFailed {
                    method: method.to_string(),
                    traceback: self.diagnostic(rpcid, method, &format!("panicked: {}", message)),
                })
            }
        }
    }

    fn diagnostic(&self, rpcid: RpcId, method: &str, text: &str) -> String {
        format!(
            "Method call failed rpcid={} node={} func={}\n{}",
            rpcid, self.inner.options.node_id, method, text
        )
    }

    /// Drop the local object `rpcid`. Returns `false` if it was not live.
    pub fn delete_local(&self, rpcid: RpcId) -> bool {
        lock(&self.inner.objects).remove(rpcid).is_some()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.inner.objects).len()
    }

    /// How many times `method` has run on local objects.
    pub fn call_stats(&self, method: &str) -> u64 {
        lock(&self.inner.call_stats).get(method)
    }

    pub fn call_stats_snapshot(&self) -> HashMap<String, u64> {
        lock(&self.inner.call_stats).snapshot()
    }

    // ========================================
    // Dispatch
    // ========================================

    /// Execute one call received from `peer_id`.
    ///
    /// Returns the answered request (state `ResponseDone`), or `None` when the
    /// call expects no reply.
    pub async fn handle(&self, mut request: Request, peer_id: PeerId) -> Option<Request> {
        let method = request.method().unwrap_or_default().to_string();
        let params = request.params().cloned().unwrap_or(Value::Null);
        debug!("Dispatching {} from peer {}", method, peer_id);

        let response = match method.as_str() {
            "create" => self.dispatch_create(params),
            "call" => self.dispatch_call(params).await,
            "delete" => self.dispatch_delete(params),
            "publish" => match parse_params::<PublishParams>("publish", params) {
                Ok(p) => {
                    self.add_publishers(peer_id, &p.classes);
                    Response::new(Status::Ack, Value::Null)
                }
                Err(failed) => failed,
            },
            "peer_exit" => {
                info!("Peer {} is exiting", peer_id);
                self.unmanage(peer_id).await;
                return None;
            }
            other => {
                warn!("No handler for method '{}' from peer {}", other, peer_id);
                Response::new(Status::NoMethod, Value::Null)
            }
        };

        if let Err(e) = request.set_response(response) {
            warn!("Dispatch of {}: {}", method, e);
        }
        if let Err(e) = request.advance(RequestState::ResponseDone) {
            warn!("Dispatch of {}: {}", method, e);
        }
        Some(request)
    }

    fn dispatch_create(&self, params: Value) -> Response {
        let p = match parse_params::<CreateParams>("create", params) {
            Ok(p) => p,
            Err(failed) => return failed,
        };
        match self.create_local(&p.class, p.args) {
            Ok(rpcid) => Response::new(Status::Created(rpcid), Value::Null),
            Err(RpcError::ClassNotFound { class }) => {
                warn!("Peer asked for unknown class {}", class);
                Response::new(Status::NoClass, Value::Null)
            }
            Err(e) => Response::new(Status::MethodFailed, Value::String(failure_text(e))),
        }
    }

    async fn dispatch_call(&self, params: Value) -> Response {
        let p = match parse_params::<CallParams>("call", params) {
            Ok(p) => p,
            Err(failed) => return failed,
        };
        match self.call_local(p.rpcid, &p.func, p.args).await {
            Ok(value) => Response::new(Status::MethodOk, value),
            Err(RpcError::MethodNotFound { method, rpcid }) => {
                debug!("No method {} on rpcid {}", method, rpcid);
                Response::new(Status::NoMethod, Value::Null)
            }
            Err(e) => Response::new(Status::MethodFailed, Value::String(failure_text(e))),
        }
    }

    fn dispatch_delete(&self, params: Value) -> Response {
        match parse_params::<DeleteParams>("delete", params) {
            Ok(p) => {
                if !self.delete_local(p.rpcid) {
                    debug!("Delete of unknown rpcid {}", p.rpcid);
                }
                Response::new(Status::Ack, Value::Null)
            }
            Err(failed) => failed,
        }
    }

    // ========================================
    // Shutdown
    // ========================================

    /// Leave every peer and drop all local objects.
    ///
    /// Each peer is told `peer_exit` and then `"quit"` before its pipe is
    /// closed, so it can clean up and stop its own consumers.
    pub async fn finish(&self) {
        let links: Vec<(PeerId, PeerLink)> = lock(&self.inner.peers).drain().collect();

        for (peer_id, link) in links {
            if !link.pipe.is_finished() {
                if let Err(e) = link.pipe.notify(Request::new("peer_exit", json!({}))).await {
                    debug!("peer_exit to {}: {}", peer_id, e);
                }
                if let Err(e) = link.pipe.send_quit().await {
                    debug!("quit to {}: {}", peer_id, e);
                }
            }
            link.pipe.close().await;
            link.pool.join().await;
            self.inner.forget_publisher(peer_id);
        }

        lock(&self.inner.objects).clear();
        info!("{} finished", self.inner.options.node_id);
    }
}

fn parse_params<T: DeserializeOwned>(
    method: &str,
    params: Value,
) -> std::result::Result<T, Response> {
    serde_json::from_value(params).map_err(|e| {
        warn!("Invalid params for {}: {}", method, e);
        Response::new(
            Status::MethodFailed,
            Value::String(format!("Invalid params for {}: {}", method, e)),
        )
    })
}

fn failure_text(error: RpcError) -> String {
    match error {
        RpcError::MethodFailed { traceback, .. } => traceback,
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Payload;

    struct Counter {
        value: std::sync::Mutex<i64>,
    }

    #[async_trait::async_trait]
    impl RpcObject for Counter {
        async fn call_method(
            &self,
            method: &str,
            args: CallArgs,
        ) -> std::result::Result<Value, MethodError> {
            match method {
                "add" => {
                    let n: i64 = args.arg(0)?;
                    let mut value = lock(&self.value);
                    *value += n;
                    Ok(json!(*value))
                }
                "fail" => Err(MethodError::failed("counter jammed")),
                "panic" => panic!("counter exploded"),
                other => Err(MethodError::NotFound(other.to_string())),
            }
        }
    }

    fn host() -> RpcHost {
        let host = RpcHost::new(HostOptions::new("test"));
        host.register("Counter", |args: CallArgs| {
            let start: i64 = args.kwarg("start")?.unwrap_or(0);
            Ok(Arc::new(Counter {
                value: std::sync::Mutex::new(start),
            }) as Arc<dyn RpcObject>)
        });
        host.set_local("Counter", true);
        host
    }

    fn incoming(method: &str, params: Value) -> Request {
        Request::incoming(1, Payload::call(method, params))
    }

    async fn answer(host: &RpcHost, method: &str, params: Value) -> Response {
        let done = host.handle(incoming(method, params), 1).await.unwrap();
        assert_eq!(done.state(), RequestState::ResponseDone);
        done.into_response().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_call() {
        let host = host();
        let created = answer(&host, "create", json!({"type": "Counter", "kwargs": {"start": 10}})).await;
        let Status::Created(rpcid) = created.status() else {
            panic!("expected Created, got {:?}", created);
        };

        let resp = answer(&host, "call", json!({"func": "add", "rpcid": rpcid, "args": [5]})).await;
        assert_eq!(resp, Response::new(Status::MethodOk, json!(15)));
        assert_eq!(host.call_stats("add"), 1);
    }

    #[tokio::test]
    async fn test_unknown_class() {
        let host = host();
        let resp = answer(&host, "create", json!({"type": "Nope"})).await;
        assert_eq!(resp, Response::new(Status::NoClass, Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_method_and_stale_rpcid() {
        let host = host();
        let rpcid = host.create_local("Counter", CallArgs::new()).unwrap();

        let resp = answer(&host, "call", json!({"func": "mul", "rpcid": rpcid})).await;
        assert_eq!(resp.status(), Status::NoMethod);

        let resp = answer(&host, "delete", json!({"rpcid": rpcid})).await;
        assert_eq!(resp.status(), Status::Ack);

        let resp = answer(&host, "call", json!({"func": "add", "rpcid": rpcid, "args": [1]})).await;
        assert_eq!(resp.status(), Status::NoMethod);
    }

    #[tokio::test]
    async fn test_failure_and_panic_become_method_failed() {
        let host = host();
        let rpcid = host.create_local("Counter", CallArgs::new()).unwrap();

        let resp = answer(&host, "call", json!({"func": "fail", "rpcid": rpcid})).await;
        assert_eq!(resp.status(), Status::MethodFailed);
        let text = resp.value().as_str().unwrap();
        assert!(text.contains("func=fail"));
        assert!(text.ends_with("counter jammed"));

        let resp = answer(&host, "call", json!({"func": "panic", "rpcid": rpcid})).await;
        assert_eq!(resp.status(), Status::MethodFailed);
        assert!(resp.value().as_str().unwrap().contains("counter exploded"));
    }

    #[tokio::test]
    async fn test_unknown_dispatch_method_answers_no_method() {
        let host = host();
        let resp = answer(&host, "frobnicate", json!({})).await;
        assert_eq!(resp.status(), Status::NoMethod);
    }

    #[tokio::test]
    async fn test_malformed_params() {
        let host = host();
        let resp = answer(&host, "call", json!({"rpcid": "zero"})).await;
        assert_eq!(resp.status(), Status::MethodFailed);
    }

    #[tokio::test]
    async fn test_publish_records_sender() {
        let host = host();
        let resp = host
            .handle(incoming("publish", json!({"classes": ["DspObject"]})), 7)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(resp.status(), Status::Ack);
        assert_eq!(host.publishers("DspObject"), vec![7]);
        assert_eq!(host.resolve_peer("DspObject", None), 7);
        assert_eq!(host.resolve_peer("DspObject", Some(2)), 2);
        assert_eq!(host.resolve_peer("Other", None), 0);
    }

    #[tokio::test]
    async fn test_request_to_unknown_peer() {
        let host = host();
        let result = host.request(9, "call", json!({})).await;
        assert!(matches!(result, Err(RpcError::UnknownPeer { peer_id: 9 })));
    }

    #[tokio::test]
    async fn test_wait_for_publisher_times_out() {
        let host = host();
        let result = host
            .wait_for_publisher("DspObject", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
    }
}
