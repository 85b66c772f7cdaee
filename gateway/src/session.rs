//! One client connection: read loop, dispatch, single writer, teardown
//!
//! A session is transport-agnostic. It reads [`Frame`]s from any stream and
//! writes JSON text into any sink; the axum adapter lives in `server`.
//!
//! All outbound text goes through one bounded queue drained by one writer
//! task, so concurrently running invocations can never interleave partial
//! writes on the connection.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use netdiag_tools::{
    sanitize_output, CommandEvent, CommandRequest, Executor, Outcome, Tool, Validator,
};

use crate::error::TransportError;
use crate::metrics::Metrics;

pub const VALIDATION_ERROR: &str = "validation error";
pub const CONCURRENCY_LIMIT: &str = "concurrency limit";
pub const INVALID_REQUEST: &str = "invalid request";
const INTERNAL_ERROR: &str = "internal error";

/// Inbound unit after the transport adapter has stripped control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    IdleTimeout,
    /// Server shutdown, or the writer gave up.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    /// Running invocations allowed per session; extra requests are refused.
    pub max_concurrent: usize,
    pub write_timeout: Duration,
    pub teardown_grace: Duration,
    /// Capacity of both the outbound queue and each invocation's event queue.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_concurrent: 5,
            write_timeout: Duration::from_secs(10),
            teardown_grace: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

/// Request-level refusal; the session stays open.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub error: &'static str,
    pub message: String,
    pub timestamp: String,
}

impl Rejection {
    pub fn new(category: &'static str, message: impl AsRef<str>) -> Self {
        Self {
            error: category,
            // May echo client input back.
            message: sanitize_output(message.as_ref()),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Shared collaborators, cloned into every invocation task.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub executor: Arc<Executor>,
    pub validator: Arc<Validator>,
    pub metrics: Arc<Metrics>,
}

pub struct Session {
    id: String,
    config: SessionConfig,
    deps: SessionDeps,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    slots: Arc<Semaphore>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        config: SessionConfig,
        deps: SessionDeps,
        cancel: CancellationToken,
        state: watch::Sender<SessionState>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            id,
            config,
            deps,
            cancel,
            state,
            slots,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn transition(&self, next: SessionState) {
        debug!(session = %self.id, "{:?} -> {next:?}", *self.state.borrow());
        self.state.send_replace(next);
    }

    /// Drive the session to completion. Every invocation it started has been
    /// stopped and the outbound sink closed by the time this returns.
    pub async fn run<I, O>(self, inbound: I, outbound: O) -> Result<SessionEnd, TransportError>
    where
        I: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
        O: Sink<String> + Send + 'static,
        O::Error: fmt::Display + Send,
    {
        let (out_tx, out_rx) = mpsc::channel(self.config.event_buffer);
        let writer = tokio::spawn(write_loop(
            outbound,
            out_rx,
            self.config.write_timeout,
            self.cancel.clone(),
        ));
        self.transition(SessionState::Active);

        let mut invocations = JoinSet::new();
        let exit = self.read_loop(inbound, &out_tx, &mut invocations).await;

        self.transition(SessionState::Closing);
        self.cancel.cancel();
        self.drain(&mut invocations).await;
        drop(out_tx);

        let written = match writer.await {
            Ok(result) => result,
            Err(e) => {
                error!(session = %self.id, "Writer task failed: {e}");
                Ok(())
            }
        };
        self.transition(SessionState::Closed);

        match exit {
            Err(e) => Err(e),
            // Writes to a peer that already hung up are expected to fail.
            Ok(SessionEnd::PeerClosed) => {
                if let Err(e) = written {
                    debug!(session = %self.id, "Write after peer close: {e}");
                }
                Ok(SessionEnd::PeerClosed)
            }
            Ok(end) => written.map(|()| end),
        }
    }

    async fn read_loop<I>(
        &self,
        mut inbound: I,
        out_tx: &mpsc::Sender<String>,
        invocations: &mut JoinSet<()>,
    ) -> Result<SessionEnd, TransportError>
    where
        I: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = &mut idle => {
                    info!(session = %self.id, "No request for {:?}, closing", self.config.idle_timeout);
                    return Ok(SessionEnd::IdleTimeout);
                }
                Some(joined) = invocations.join_next(), if !invocations.is_empty() => {
                    if let Err(e) = joined {
                        error!(session = %self.id, "Invocation task failed: {e}");
                    }
                }
                frame = inbound.next() => match frame {
                    None | Some(Ok(Frame::Close)) => return Ok(SessionEnd::PeerClosed),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Frame::Binary)) => {
                        self.reject(out_tx, INVALID_REQUEST, "binary frames are not supported").await;
                    }
                    Some(Ok(Frame::Text(text))) => match serde_json::from_str::<CommandRequest>(&text) {
                        Ok(request) => {
                            idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                            self.dispatch(request, out_tx, invocations).await;
                        }
                        Err(e) => {
                            debug!(session = %self.id, "Malformed request: {e}");
                            self.reject(out_tx, INVALID_REQUEST, format!("malformed request: {e}")).await;
                        }
                    },
                },
            }
        }
    }

    async fn dispatch(
        &self,
        request: CommandRequest,
        out_tx: &mpsc::Sender<String>,
        invocations: &mut JoinSet<()>,
    ) {
        let tool = match self.deps.validator.validate_request(&request) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(session = %self.id, tool = %request.tool, "Rejected request: {e}");
                self.deps.metrics.validation_rejected();
                self.reject(out_tx, VALIDATION_ERROR, e.to_string()).await;
                return;
            }
        };

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(session = %self.id, %tool, "Concurrency limit reached");
                self.deps.metrics.concurrency_rejected();
                let message = format!(
                    "at most {} commands may run at once on a connection",
                    self.config.max_concurrent
                );
                self.reject(out_tx, CONCURRENCY_LIMIT, message).await;
                return;
            }
        };

        let invocation = Invocation {
            id: Uuid::new_v4(),
            session: self.id.clone(),
            tool,
            target: request.target.trim().to_string(),
            request,
            deps: self.deps.clone(),
            cancel: self.cancel.child_token(),
            out_tx: out_tx.clone(),
            event_buffer: self.config.event_buffer,
            _permit: permit,
        };
        invocations.spawn(invocation.run());
    }

    async fn reject(&self, out_tx: &mpsc::Sender<String>, category: &'static str, message: impl AsRef<str>) {
        match serde_json::to_string(&Rejection::new(category, message)) {
            Ok(json) => {
                if out_tx.send(json).await.is_err() {
                    debug!(session = %self.id, "Writer gone, rejection dropped");
                }
            }
            Err(e) => error!(session = %self.id, "Failed to encode rejection: {e}"),
        }
    }

    async fn drain(&self, invocations: &mut JoinSet<()>) {
        if invocations.is_empty() {
            return;
        }
        let grace = self.config.teardown_grace;
        let joined = tokio::time::timeout(grace, async {
            while invocations.join_next().await.is_some() {}
        })
        .await;

        if joined.is_err() {
            warn!(
                session = %self.id,
                remaining = invocations.len(),
                "Invocations still running after {grace:?}, aborting"
            );
            invocations.abort_all();
            while invocations.join_next().await.is_some() {}
        }
    }
}

/// One validated request in flight.
struct Invocation {
    id: Uuid,
    session: String,
    tool: Tool,
    target: String,
    request: CommandRequest,
    deps: SessionDeps,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<String>,
    event_buffer: usize,
    _permit: OwnedSemaphorePermit,
}

impl Invocation {
    async fn run(self) {
        let Invocation {
            id,
            session,
            tool,
            target,
            request,
            deps,
            cancel,
            out_tx,
            event_buffer,
            _permit,
        } = self;

        deps.metrics.invocation_started();
        info!(%session, invocation = %id, %tool, %target, "Invocation started");

        let (tx, rx) = mpsc::channel(event_buffer);
        let work = async {
            let (outcome, ()) = tokio::join!(
                deps.executor
                    .execute(&cancel, tool, &target, &request.parameters, tx),
                forward(rx, &out_tx),
            );
            outcome
        };

        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(%session, invocation = %id, "Invocation panicked");
                let event =
                    CommandEvent::terminal(tool, &target, Utc::now(), Some(INTERNAL_ERROR.into()));
                send_event(&out_tx, event).await;
                Outcome::Failed
            }
        };

        deps.metrics.invocation_finished(outcome);
        info!(%session, invocation = %id, %tool, ?outcome, "Invocation finished");
    }
}

/// Sanitize and serialize events onto the outbound queue. Stopping early
/// drops `rx`, which the executor treats as cancellation.
async fn forward(mut rx: mpsc::Receiver<CommandEvent>, out_tx: &mpsc::Sender<String>) {
    while let Some(event) = rx.recv().await {
        if !send_event(out_tx, event.sanitized()).await {
            break;
        }
    }
}

/// `false` once the writer is gone.
async fn send_event(out_tx: &mpsc::Sender<String>, event: CommandEvent) -> bool {
    let json = match serde_json::to_string(&event) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode event: {e}");
            if !event.is_terminal() {
                return true;
            }
            // The terminal event must still reach the client.
            let fallback =
                CommandEvent::terminal(event.tool, &event.target, event.start_time, Some(INTERNAL_ERROR.into()));
            match serde_json::to_string(&fallback) {
                Ok(json) => json,
                Err(_) => return true,
            }
        }
    };
    out_tx.send(json).await.is_ok()
}

async fn write_loop<O>(
    sink: O,
    mut rx: mpsc::Receiver<String>,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    O: Sink<String> + Send + 'static,
    O::Error: fmt::Display + Send,
{
    let mut sink = Box::pin(sink);

    while let Some(text) = rx.recv().await {
        let result = match tokio::time::timeout(write_timeout, sink.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout(write_timeout)),
        };
        if let Err(e) = result {
            cancel.cancel();
            return Err(e);
        }
    }

    match tokio::time::timeout(write_timeout, sink.close()).await {
        Ok(Err(e)) => debug!("Closing outbound sink: {e}"),
        Err(_) => debug!("Closing outbound sink timed out"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
