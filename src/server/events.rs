//! `/api/events` WebSocket bridge
//!
//! A single drain task reads the backend's event stream, serializes each event
//! once, and fans it out on a broadcast channel. Every connected client gets
//! its own subscription plus a writer task; events published while no client
//! is connected are dropped.
//!
//! Each connection runs three loops under one cancellation token: the reader
//! (detects close), the relay (subscription to outbound queue), and the
//! writer (outbound queue to socket). Whichever finishes first cancels the
//! other two.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::BackendEvent;

/// Events buffered per subscriber before a slow client starts skipping.
pub const EVENT_BUFFER: usize = 256;

pub struct EventBridge {
    tx: broadcast::Sender<Arc<str>>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl EventBridge {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serialize `event` and deliver it to every connected client.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: &BackendEvent) -> usize {
        let text: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                error!(target: "ws", error = %e, "failed to serialize backend event");
                return 0;
            }
        };
        self.tx.send(text).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Forward the backend's event stream until it ends or the bridge shuts down.
    pub fn spawn_drain(
        self: &Arc<Self>,
        mut source: mpsc::UnboundedReceiver<BackendEvent>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = bridge.shutdown.cancelled() => break,
                    event = source.recv() => match event {
                        Some(event) => {
                            let receivers = bridge.publish(&event);
                            trace!(target: "ws", receivers, "relayed backend event");
                        }
                        None => {
                            debug!(target: "ws", "backend event stream closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Number of event sockets that have not finished tearing down.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the drain and close every client connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        // Subscribed before counted, so a counted client never misses an event.
        let mut events = self.subscribe();
        let _guard = ActiveGuard::acquire(&self.active);
        let cancel = self.shutdown.child_token();
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        info!(target: "ws", active = self.active_connections(), "event client connected");

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                debug!(target: "ws", error = %e, "event write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let relay_cancel = cancel.clone();
        let relay = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = relay_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(text) => {
                            if out_tx.send(Message::Text(text.to_string())).is_err() {
                                relay_cancel.cancel();
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "ws", skipped, "event client lagging; events dropped");
                        }
                        Err(RecvError::Closed) => {
                            relay_cancel.cancel();
                            break;
                        }
                    },
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(target: "ws", error = %e, "event read failed");
                        break;
                    }
                    // Inbound frames carry nothing; pings are answered by the socket.
                    Some(Ok(_)) => {}
                },
            }
        }
        cancel.cancel();

        let _ = relay.await;
        let _ = writer.await;
        info!(target: "ws", "event client disconnected");
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Upgrade `/api/events` to a WebSocket fed by the bridge.
///
/// The route sits behind the same `Authorization` header gate as the rest
/// of `/api`; the token is not read from the query string or from a first
/// message. Clients that cannot set request headers on a WebSocket
/// handshake, such as the browser `WebSocket` API, cannot subscribe.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<Arc<EventBridge>>,
) -> Response {
    ws.on_upgrade(move |socket| bridge.serve_socket(socket))
}
