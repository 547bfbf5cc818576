//! Correlation engine: matches responses to requests and routes everything
//! else to caller-registered sinks.
//!
//! Per-request lifecycle: `Issued → (Completed | TimedOut | Cancelled)`.
//! A request is issued by [`Correlator::register_pending`], which must run
//! before the request is written so a fast response can't race the entry.
//! [`Correlator::on_frame_received`] is the only path that completes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::LspError;
use crate::message::{Message, Notification, Request, RequestId, Response, ResponsePayload};

/// Events a caller may want to see but that are not protocol traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// One line the server wrote to stderr.
    Stderr(String),
    /// A response whose id matches nothing pending.
    UnmatchedResponse {
        id: Option<RequestId>,
        payload: ResponsePayload,
    },
    /// A response that matched, but whose caller had already stopped waiting.
    LateResponse {
        id: RequestId,
        method: String,
        waited: Duration,
    },
    /// Emitted once when consecutive unmatched responses reach the threshold.
    ProtocolDesync { consecutive_unmatched: usize },
    /// A frame was discarded by the codec or the payload parser.
    FrameError(String),
    /// The server sent a request and nobody is registered to answer it.
    UnhandledServerRequest { id: RequestId, method: String },
    /// The server closed stdout; no more responses will arrive.
    StdoutClosed,
}

/// How an incoming message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Completed(RequestId),
    Unmatched,
    Notification { routed: bool },
    ServerRequest { routed: bool },
}

/// Result of waiting on a [`ResponseSlot`].
#[derive(Debug)]
pub enum Awaited {
    Ready(Response),
    /// The entry is still registered; the slot comes back so the caller can
    /// keep waiting or drop it.
    TimedOut(ResponseSlot),
}

/// Caller-side half of a pending request.
#[derive(Debug)]
pub struct ResponseSlot {
    id: RequestId,
    method: String,
    issued_at: Instant,
    rx: oneshot::Receiver<Response>,
}

impl ResponseSlot {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Time since the request was registered.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Wait up to `timeout` for the response. A zero timeout still returns a
    /// response that has already arrived.
    pub async fn wait(mut self, timeout: Duration) -> Result<Awaited, LspError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(Awaited::Ready(response)),
            Ok(Err(_)) => Err(LspError::TransportClosed),
            Err(_) => Ok(Awaited::TimedOut(self)),
        }
    }
}

struct PendingRequest {
    id: RequestId,
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Response>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
    closed: bool,
    consecutive_unmatched: usize,
}

#[derive(Default)]
struct Sinks {
    by_method: HashMap<String, mpsc::UnboundedSender<Notification>>,
    catch_all: Option<mpsc::UnboundedSender<Notification>>,
    server_requests: Option<mpsc::UnboundedSender<Request>>,
    diagnostics: Option<mpsc::UnboundedSender<DiagnosticEvent>>,
}

/// Pending-request table, id counter and sink registry for one session.
pub struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<PendingTable>,
    sinks: Mutex<Sinks>,
    desync_threshold: usize,
}

impl Correlator {
    #[must_use]
    pub fn new(desync_threshold: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(PendingTable::default()),
            sinks: Mutex::new(Sinks::default()),
            desync_threshold,
        }
    }

    /// Strictly increasing, never reused within this correlator's lifetime.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Record that a response for `id` is awaited.
    pub async fn register_pending(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> Result<ResponseSlot, LspError> {
        let method = method.into();
        let issued_at = Instant::now();
        let (tx, rx) = oneshot::channel();

        let mut table = self.pending.lock().await;
        if table.closed {
            return Err(LspError::TransportClosed);
        }
        let entry = PendingRequest {
            id: id.clone(),
            method: method.clone(),
            issued_at,
            tx,
        };
        if table.entries.insert(id.clone(), entry).is_some() {
            tracing::warn!(%id, "Replaced an existing pending request with the same id");
        }

        Ok(ResponseSlot {
            id,
            method,
            issued_at,
            rx,
        })
    }

    /// Wait for `slot` to resolve, bounded by `timeout`.
    pub async fn await_response(
        &self,
        slot: ResponseSlot,
        timeout: Duration,
    ) -> Result<Awaited, LspError> {
        slot.wait(timeout).await
    }

    /// Drop a pending entry without notifying the server. Returns whether the
    /// entry existed. A response arriving later is classified as unmatched.
    pub async fn abandon(&self, id: &RequestId) -> bool {
        self.pending.lock().await.entries.remove(id).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    /// Fail every pending request with `TransportClosed` and refuse new ones.
    pub async fn close(&self) {
        let mut table = self.pending.lock().await;
        table.closed = true;
        let dropped = table.entries.len();
        table.entries.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Failed pending requests after stdout closed");
        }
    }

    /// Route one incoming message.
    pub async fn on_frame_received(&self, message: Message) -> Dispatch {
        match message {
            Message::Response(response) => self.complete(response).await,
            Message::Notification(notification) => {
                let method = notification.method.clone();
                let routed = route_notification(&mut *self.sinks.lock().await, notification);
                if !routed {
                    tracing::trace!("Ignoring notification with no sink: {method}");
                }
                Dispatch::Notification { routed }
            }
            Message::Request(request) => {
                let id = request.id.clone();
                let method = request.method.clone();
                let routed = {
                    let mut sinks = self.sinks.lock().await;
                    let delivered = sinks
                        .server_requests
                        .as_ref()
                        .map(|tx| tx.send(request).is_ok());
                    if delivered == Some(false) {
                        sinks.server_requests = None;
                    }
                    delivered == Some(true)
                };
                if routed {
                    tracing::debug!(%id, "Server request: {method}");
                } else {
                    tracing::warn!(%id, "No handler for server request: {method}");
                    self.report(DiagnosticEvent::UnhandledServerRequest { id, method })
                        .await;
                }
                Dispatch::ServerRequest { routed }
            }
        }
    }

    async fn complete(&self, response: Response) -> Dispatch {
        let (entry, consecutive_unmatched) = {
            let mut table = self.pending.lock().await;
            let entry = response
                .id
                .as_ref()
                .and_then(|id| table.entries.remove(id));
            if entry.is_some() {
                table.consecutive_unmatched = 0;
            } else {
                table.consecutive_unmatched += 1;
            }
            (entry, table.consecutive_unmatched)
        };

        if let Some(entry) = entry {
            let waited = entry.issued_at.elapsed();
            if entry.tx.send(response).is_err() {
                tracing::debug!(
                    id = %entry.id,
                    method = %entry.method,
                    "Response arrived after the caller stopped waiting"
                );
                self.report(DiagnosticEvent::LateResponse {
                    id: entry.id.clone(),
                    method: entry.method,
                    waited,
                })
                .await;
            }
            return Dispatch::Completed(entry.id);
        }

        tracing::warn!(id = ?response.id, "Dropping response with no pending request");
        self.report(DiagnosticEvent::UnmatchedResponse {
            id: response.id,
            payload: response.payload,
        })
        .await;

        if consecutive_unmatched == self.desync_threshold {
            tracing::error!(
                consecutive_unmatched,
                "Language server responses no longer match requests"
            );
            self.report(DiagnosticEvent::ProtocolDesync {
                consecutive_unmatched,
            })
            .await;
        }
        Dispatch::Unmatched
    }

    /// Forward an event to the diagnostics sink, if one is registered.
    pub async fn report(&self, event: DiagnosticEvent) {
        let mut sinks = self.sinks.lock().await;
        if let Some(tx) = &sinks.diagnostics
            && tx.send(event).is_err()
        {
            sinks.diagnostics = None;
        }
    }

    /// Receive notifications for `method`. Replaces any earlier sink for it.
    pub async fn on_notification(
        &self,
        method: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.by_method.insert(method.into(), tx);
        rx
    }

    /// Receive notifications no method-specific sink claimed.
    pub async fn on_any_notification(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.catch_all = Some(tx);
        rx
    }

    /// Receive requests initiated by the server. Nothing answers them
    /// automatically.
    pub async fn on_server_request(&self) -> mpsc::UnboundedReceiver<Request> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.server_requests = Some(tx);
        rx
    }

    pub async fn diagnostics(&self) -> mpsc::UnboundedReceiver<DiagnosticEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.diagnostics = Some(tx);
        rx
    }
}

/// Method sink first, then catch-all. Sinks whose receiver was dropped are
/// unregistered on the way.
fn route_notification(sinks: &mut Sinks, notification: Notification) -> bool {
    let notification = match sinks.by_method.get(&notification.method) {
        Some(tx) => match tx.send(notification) {
            Ok(()) => return true,
            Err(mpsc::error::SendError(notification)) => {
                sinks.by_method.remove(&notification.method);
                notification
            }
        },
        None => notification,
    };

    if let Some(tx) = &sinks.catch_all {
        if tx.send(notification).is_ok() {
            return true;
        }
        sinks.catch_all = None;
    }
    false
}
