//! Session controller: drives the LSP handshake and exposes the generic
//! request/notification surface.
//!
//! `start()` spawns the server and the pump task that feeds every incoming
//! frame into the [`Correlator`]. Callers never read from the server
//! themselves, so a caller blocked on a response cannot starve the reader.
//!
//! All methods take `&self`; wrap the session in an `Arc` to issue requests
//! from several tasks.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::codec::Frame;
use crate::config::ServerConfig;
use crate::correlation::{Awaited, Correlator, DiagnosticEvent, ResponseSlot};
use crate::error::LspError;
use crate::message::{Message, Notification, Request, RequestId, ResponsePayload};
use crate::transport::{Inbound, InboundEvent, ProcessState, Transport};

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
}

/// One protocol conversation with one language server process.
pub struct Session {
    config: ServerConfig,
    transport: Transport,
    correlator: Arc<Correlator>,
    state: watch::Sender<SessionState>,
    server_capabilities: OnceLock<Value>,
    pump_handle: JoinHandle<()>,
}

impl Session {
    /// Spawn the server described by `config` and start pumping its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ServerConfig) -> Result<Self, LspError> {
        let (transport, inbound) = Transport::start(&config)?;
        let correlator = Arc::new(Correlator::new(config.desync_threshold()));
        let pump_handle = tokio::spawn(pump(inbound, correlator.clone()));
        let (state, _) = watch::channel(SessionState::Uninitialized);

        Ok(Self {
            config,
            transport,
            correlator,
            state,
            server_capabilities: OnceLock::new(),
            pump_handle,
        })
    }

    /// Send `initialize` for workspace `root` and wait for the server.
    ///
    /// Params carry `processId`, `rootUri`, `rootPath`, `capabilities` and a
    /// single workspace folder, plus `initializationOptions` and `trace` from
    /// the config when set. Returns the server's `InitializeResult`.
    pub async fn initialize(&self, capabilities: Value, root: &Url) -> Result<Value, LspError> {
        let mut params = json!({
            "processId": std::process::id(),
            "rootUri": root.as_str(),
            "capabilities": capabilities,
            "workspaceFolders": [{
                "uri": root.as_str(),
                "name": workspace_name(root)
            }]
        });
        if let Ok(path) = root.to_file_path() {
            params["rootPath"] = json!(path.display().to_string());
        }
        if let Some(options) = self.config.initialization_options() {
            params["initializationOptions"] = options.clone();
        }
        if let Some(trace) = self.config.trace() {
            params["trace"] = json!(trace);
        }
        self.initialize_with(params).await
    }

    /// Send `initialize` with caller-built params.
    ///
    /// On failure the process is left running so its stderr can still be
    /// inspected; the session returns to `Uninitialized`.
    pub async fn initialize_with(&self, params: Value) -> Result<Value, LspError> {
        self.transition(
            SessionState::Uninitialized,
            SessionState::Initializing,
            "initialize",
        )?;
        tracing::info!(command = %self.config.command(), "Initializing language server");

        let outcome = self
            .round_trip("initialize", Some(params), self.config.timeouts().initialize())
            .await;

        let failure = match outcome {
            Ok(ResponsePayload::Result(result)) => {
                let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
                let _ = self.server_capabilities.set(capabilities);
                self.state.send_replace(SessionState::Ready);
                tracing::info!(command = %self.config.command(), "Language server initialized");
                return Ok(result);
            }
            Ok(ResponsePayload::Error(err)) => err.to_string(),
            Err(e) => e.to_string(),
        };

        self.state.send_replace(SessionState::Uninitialized);
        tracing::warn!(command = %self.config.command(), "LSP initialize failed: {failure}");
        Err(LspError::HandshakeFailure(failure))
    }

    /// Send the post-handshake `initialized` notification.
    pub async fn notify_initialized(&self) -> Result<(), LspError> {
        self.require_ready("notify_initialized")?;
        self.send_notification("initialized", Some(json!({})), self.config.timeouts().request())
            .await
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// `timeout` covers writing the request as well as the wait. A JSON-RPC
    /// error from the server is returned as [`ResponsePayload::Error`], not
    /// as `Err`.
    ///
    /// On [`LspError::TimedOut`] the request stays registered so a late
    /// response is reported on the diagnostics sink instead of looking
    /// unmatched. Pass the error's `id` to [`Session::abandon`] once the
    /// answer is no longer of interest; otherwise the entry lives until the
    /// session closes. Use [`Session::request`] to keep waiting instead.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<ResponsePayload, LspError> {
        self.require_ready("call")?;
        self.round_trip(method, params, timeout).await
    }

    /// [`Session::call`] with the configured default request timeout.
    pub async fn call_default(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ResponsePayload, LspError> {
        self.call(method, params, self.config.timeouts().request())
            .await
    }

    /// Send a request without waiting; pair with [`Session::await_response`].
    ///
    /// Writing the request is bounded by the configured request timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ResponseSlot, LspError> {
        self.require_ready("request")?;
        let deadline = Instant::now() + self.config.timeouts().request();
        self.issue(method, params, deadline).await
    }

    pub async fn await_response(
        &self,
        slot: ResponseSlot,
        timeout: Duration,
    ) -> Result<Awaited, LspError> {
        self.correlator.await_response(slot, timeout).await
    }

    /// Stop tracking a request. Nothing is sent to the server.
    pub async fn abandon(&self, id: &RequestId) -> bool {
        self.correlator.abandon(id).await
    }

    /// Requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.correlator.pending_count().await
    }

    /// Fire-and-forget notification. Writing it is bounded by the configured
    /// request timeout.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        self.require_ready("notify")?;
        self.send_notification(method, params, self.config.timeouts().request())
            .await
    }

    /// Answer a request the server sent (see [`Session::on_server_request`]).
    ///
    /// Allowed during the handshake too, since servers may ask for
    /// configuration before answering `initialize`.
    pub async fn respond(&self, id: RequestId, payload: ResponsePayload) -> Result<(), LspError> {
        let state = self.state();
        if state == SessionState::Terminated {
            return Err(LspError::InvalidState {
                operation: "respond",
                state,
            });
        }
        let frame = Message::response(id, payload).to_frame()?;
        self.send_within(frame, "response", self.config.timeouts().request())
            .await
    }

    /// `shutdown` → `exit` → close stdin → two-phase termination.
    ///
    /// Every step runs even when the one before it failed, and the whole
    /// sequence is a no-op on a session that is already terminated. Each
    /// message is bounded by the shutdown timeout, so a server that stopped
    /// reading its input still reaches termination. Returns the exit status
    /// when the process could be reaped.
    pub async fn shutdown_and_exit(&self) -> Result<Option<ExitStatus>, LspError> {
        let previous = self.state.send_replace(SessionState::ShuttingDown);
        if previous == SessionState::Terminated {
            self.state.send_replace(SessionState::Terminated);
            return Ok(self.transport.process().exit_status());
        }

        let timeouts = *self.config.timeouts();
        let already_exited = match self.transport.process().try_wait().await {
            Ok(status) => status.is_some(),
            Err(e) => {
                tracing::debug!("Could not poll language server status: {e}");
                false
            }
        };

        if already_exited {
            tracing::debug!("Language server already exited; skipping shutdown/exit");
        } else {
            match self.round_trip("shutdown", None, timeouts.shutdown()).await {
                Ok(ResponsePayload::Result(_)) => tracing::debug!("Shutdown acknowledged"),
                Ok(ResponsePayload::Error(err)) => {
                    tracing::warn!("Language server rejected shutdown: {err}");
                }
                Err(e) => tracing::warn!("Shutdown request failed: {e}"),
            }
            if let Err(e) = self
                .send_notification("exit", None, timeouts.shutdown())
                .await
            {
                tracing::debug!("Could not send exit notification: {e}");
            }
        }

        self.transport.close_stdin();

        let status = match self.transport.wait(timeouts.grace()).await {
            Ok(Some(status)) => Ok(Some(status)),
            Ok(None) => self.transport.shutdown(timeouts.grace()).await,
            Err(e) => {
                tracing::debug!("Waiting for language server failed: {e}");
                self.transport.shutdown(timeouts.grace()).await
            }
        };

        self.state.send_replace(SessionState::Terminated);
        let status = status?;
        tracing::info!(command = %self.config.command(), ?status, "Language server terminated");
        Ok(status)
    }

    /// Receive notifications for `method`. Replaces an earlier sink for the
    /// same method.
    pub async fn on_notification(&self, method: &str) -> mpsc::UnboundedReceiver<Notification> {
        self.correlator.on_notification(method).await
    }

    /// Receive notifications that no method-specific sink claimed.
    pub async fn on_any_notification(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.correlator.on_any_notification().await
    }

    /// Receive requests initiated by the server. Answer them with
    /// [`Session::respond`].
    pub async fn on_server_request(&self) -> mpsc::UnboundedReceiver<Request> {
        self.correlator.on_server_request().await
    }

    /// Stderr lines, unmatched responses, discarded frames and similar.
    pub async fn diagnostics(&self) -> mpsc::UnboundedReceiver<DiagnosticEvent> {
        self.correlator.diagnostics().await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Capabilities from the `initialize` result, once the handshake succeeded.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<&Value> {
        self.server_capabilities.get()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.transport.process().pid()
    }

    #[must_use]
    pub fn process_state(&self) -> ProcessState {
        self.transport.process().state()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn transition(
        &self,
        from: SessionState,
        to: SessionState,
        operation: &'static str,
    ) -> Result<(), LspError> {
        let mut actual = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                actual = *state;
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(LspError::InvalidState {
                operation,
                state: actual,
            })
        }
    }

    fn require_ready(&self, operation: &'static str) -> Result<(), LspError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(LspError::InvalidState { operation, state }),
        }
    }

    /// Register and write a request.
    ///
    /// A write still blocked at `deadline` fails with `TimedOut` and, like a
    /// response timeout, leaves the request registered: the frame may yet
    /// reach the server.
    async fn issue(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<ResponseSlot, LspError> {
        let id = self.correlator.next_id();
        // Register before sending so a fast response always finds its entry.
        let slot = self.correlator.register_pending(id.clone(), method).await?;

        let sent = match Message::request(id.clone(), method, params).to_frame() {
            Ok(frame) => tokio::time::timeout_at(deadline, self.transport.send(frame)).await,
            Err(e) => Ok(Err(e)),
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.abandon(&id).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(%id, "Language server is not reading; gave up writing {method}");
                return Err(LspError::TimedOut {
                    id,
                    method: method.to_string(),
                    elapsed: slot.elapsed(),
                });
            }
        }

        tracing::debug!(%id, "Sent request: {method}");
        Ok(slot)
    }

    /// Issue a request and wait for its response, all within `timeout`.
    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<ResponsePayload, LspError> {
        let deadline = Instant::now() + timeout;
        let slot = self.issue(method, params, deadline).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match slot.wait(remaining).await? {
            Awaited::Ready(response) => Ok(response.payload),
            Awaited::TimedOut(slot) => Err(LspError::TimedOut {
                id: slot.id().clone(),
                method: method.to_string(),
                elapsed: slot.elapsed(),
            }),
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), LspError> {
        let frame = Message::notification(method, params).to_frame()?;
        self.send_within(frame, method, timeout).await?;
        tracing::debug!("Sent notification: {method}");
        Ok(())
    }

    async fn send_within(
        &self,
        frame: Frame,
        what: &str,
        timeout: Duration,
    ) -> Result<(), LspError> {
        tokio::time::timeout(timeout, self.transport.send(frame))
            .await
            .unwrap_or_else(|_| {
                Err(LspError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("writing {what} timed out after {timeout:?}"),
                )))
            })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The child itself is killed on drop by the transport.
        self.pump_handle.abort();
    }
}

fn workspace_name(root: &Url) -> String {
    root.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map_or_else(|| String::from("workspace"), String::from)
}

/// Feed everything the server writes into the correlator. Framing and parse
/// errors stop here: the frame is dropped and reading continues.
async fn pump(mut inbound: Inbound, correlator: Arc<Correlator>) {
    while let Some(event) = inbound.next().await {
        match event {
            InboundEvent::Frame(Ok(frame)) => match Message::from_frame(&frame) {
                Ok(message) => {
                    correlator.on_frame_received(message).await;
                }
                Err(e) => discard(&correlator, e).await,
            },
            InboundEvent::Frame(Err(e)) => discard(&correlator, e).await,
            InboundEvent::Stderr(line) => {
                tracing::debug!("LSP stderr: {line}");
                correlator.report(DiagnosticEvent::Stderr(line)).await;
            }
            InboundEvent::StdoutClosed => {
                tracing::info!("Language server closed stdout");
                correlator.close().await;
                correlator.report(DiagnosticEvent::StdoutClosed).await;
            }
        }
    }
}

async fn discard(correlator: &Correlator, err: LspError) {
    if err.is_frame_error() {
        tracing::warn!("Discarding LSP frame: {err}");
    } else {
        tracing::error!("Reading language server output failed: {err}");
    }
    correlator
        .report(DiagnosticEvent::FrameError(err.to_string()))
        .await;
}
