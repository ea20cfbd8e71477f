//! Consumer pool draining a request pipe.
//!
//! Workers poll the pipe with a short timeout, correlate what they read, and
//! hand fresh calls to an `InboundHandler` on their own task. The pool stops
//! when a worker sees the `"quit"` sentinel, when the pipe closes, or when the
//! pipe is finished from elsewhere; any of these finishes the pipe, which in
//! turn stops every worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::error::RpcError;
use crate::pipe::{lock, Inbound, Polled, RequestPipe};
use crate::request::Request;

/// Executes calls that arrive from the peer.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle one call in `ResponsePending` state. Answering is up to the
    /// handler (normally `pipe.respond`).
    async fn handle_request(&self, pipe: Arc<RequestPipe>, request: Request);
}

/// Workers sharing one pipe.
pub struct ConsumerPool {
    pipe: Arc<RequestPipe>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl ConsumerPool {
    /// Start `workers` consumers (at least one) on `pipe`.
    pub fn start(
        pipe: Arc<RequestPipe>,
        workers: usize,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let count = workers.max(1);
        let active = Arc::new(AtomicUsize::new(count));
        let handles = (0..count)
            .map(|index| {
                tokio::spawn(Self::run_worker(
                    index,
                    pipe.clone(),
                    handler.clone(),
                    active.clone(),
                ))
            })
            .collect();

        debug!("Started {} consumers for peer {}", count, pipe.peer_id());

        Self {
            pipe,
            workers: Mutex::new(handles),
            active,
        }
    }

    async fn run_worker(
        index: usize,
        pipe: Arc<RequestPipe>,
        handler: Arc<dyn InboundHandler>,
        active: Arc<AtomicUsize>,
    ) {
        let shutdown = pipe.shutdown_signal();

        loop {
            let polled = tokio::select! {
                _ = shutdown.triggered() => break,
                polled = pipe.get(Some(TransportConfig::POLL_TIMEOUT)) => polled,
            };

            match polled {
                Ok(Polled::Empty) => continue,
                Ok(Polled::Closed) => {
                    info!("Peer {} closed the pipe", pipe.peer_id());
                    pipe.finish();
                    break;
                }
                Ok(Polled::Message(message)) => {
                    let inbound = pipe.process(message);
                    if inbound.is_quit() {
                        info!("Consumer {} got quit from peer {}", index, pipe.peer_id());
                        pipe.finish();
                        break;
                    }
                    if let Inbound::Call(request) = inbound {
                        let handler = handler.clone();
                        let pipe = pipe.clone();
                        tokio::spawn(async move {
                            handler.handle_request(pipe, request).await;
                        });
                    }
                }
                Err(RpcError::Json { message, .. }) => {
                    warn!("Skipping undecodable frame from peer {}: {}", pipe.peer_id(), message);
                }
                Err(e) => {
                    error!("Pipe to peer {} unusable: {}", pipe.peer_id(), e);
                    pipe.finish();
                    break;
                }
            }
        }

        active.fetch_sub(1, Ordering::SeqCst);
        debug!("Consumer {} for peer {} exited", index, pipe.peer_id());
    }

    pub fn pipe(&self) -> &Arc<RequestPipe> {
        &self.pipe
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop all workers. Idempotent.
    pub fn finish(&self) {
        self.pipe.finish();
    }

    /// Wait for every worker to exit.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *lock(&self.workers));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Consumer for peer {} panicked", self.pipe.peer_id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestState, Response, Status};
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Answers every call with its own params.
    struct Echo;

    #[async_trait::async_trait]
    impl InboundHandler for Echo {
        async fn handle_request(&self, pipe: Arc<RequestPipe>, mut request: Request) {
            let params = request.params().cloned().unwrap_or(Value::Null);
            request
                .set_response(Response::new(Status::MethodOk, params))
                .unwrap();
            request.advance(RequestState::ResponseDone).unwrap();
            pipe.respond(&request).await.unwrap();
        }
    }

    fn pools(workers: usize) -> (ConsumerPool, ConsumerPool) {
        let (master, slave) = RequestPipe::pair();
        (
            ConsumerPool::start(Arc::new(master), workers, Arc::new(Echo)),
            ConsumerPool::start(Arc::new(slave), workers, Arc::new(Echo)),
        )
    }

    #[tokio::test]
    async fn test_calls_answered_through_pools() {
        let (master, _slave) = pools(1);
        let pipe = master.pipe();

        let reply = pipe.put(Request::new("call", json!({"n": 5}))).await.unwrap();
        let done = pipe.wait(reply).await.unwrap();
        assert_eq!(done.response().unwrap().value(), &json!({"n": 5}));
    }

    #[tokio::test]
    async fn test_quit_stops_every_worker() {
        let (master, slave) = pools(3);
        assert_eq!(slave.active_workers(), 3);

        master.pipe().send_quit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), slave.join())
            .await
            .expect("slave pool should stop");

        assert_eq!(slave.active_workers(), 0);
        assert!(slave.pipe().is_finished());
        assert!(!master.pipe().is_finished());
    }

    #[tokio::test]
    async fn test_closed_pipe_finishes_pool() {
        let (master, slave) = pools(2);
        master.pipe().close().await;

        tokio::time::timeout(Duration::from_secs(2), slave.join())
            .await
            .expect("slave pool should stop on end-of-stream");
        assert!(slave.pipe().is_finished());
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let (master, _slave) = pools(2);
        master.finish();
        master.finish();
        tokio::time::timeout(Duration::from_secs(2), master.join())
            .await
            .unwrap();
        assert_eq!(master.active_workers(), 0);
    }
}
