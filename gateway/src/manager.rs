//! Session registry and broadcast shutdown
//!
//! The manager owns the set of live sessions. Each session runs under a
//! child of the manager's shutdown token, so [`SessionManager::shutdown`]
//! tears down every session, and through them every running tool.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Sink, Stream};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use netdiag_tools::{Executor, Validator};

use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::session::{Frame, Session, SessionConfig, SessionDeps, SessionEnd, SessionState};

struct SessionHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

pub struct SessionManager {
    deps: SessionDeps,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    shutdown: CancellationToken,
    drained: Notify,
}

impl SessionManager {
    pub fn new(
        executor: Executor,
        validator: Validator,
        config: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            deps: SessionDeps {
                executor: Arc::new(executor),
                validator: Arc::new(validator),
                metrics,
            },
            config,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            drained: Notify::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.deps.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one connection to completion.
    pub async fn serve<I, O>(&self, inbound: I, outbound: O) -> Result<SessionEnd, TransportError>
    where
        I: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
        O: Sink<String> + Send + 'static,
        O::Error: fmt::Display + Send,
    {
        let id = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let _registration = self.register(&id, cancel.clone(), state_rx);
        info!(session = %id, "Session opened");

        let session = Session::new(id.clone(), self.config.clone(), self.deps.clone(), cancel, state_tx);
        let result = session.run(inbound, outbound).await;

        match &result {
            Ok(end) => info!(session = %id, ?end, "Session closed"),
            Err(e) => warn!(session = %id, "Session closed: {e}"),
        }
        result
    }

    fn register(
        &self,
        id: &str,
        cancel: CancellationToken,
        state: watch::Receiver<SessionState>,
    ) -> Registration<'_> {
        self.lock().insert(id.to_string(), SessionHandle { cancel, state });
        self.deps.metrics.session_opened();
        Registration {
            manager: self,
            id: id.to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().len()
    }

    /// Ids and current states of every registered session.
    pub fn sessions(&self) -> Vec<(String, SessionState)> {
        self.lock()
            .iter()
            .map(|(id, handle)| (id.clone(), *handle.state.borrow()))
            .collect()
    }

    /// Cancel a single session. Returns `false` if it is not registered.
    pub fn close(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session, current and future.
    pub fn shutdown(&self) {
        let count = self.active_sessions();
        info!("Shutting down {count} session(s)");
        self.shutdown.cancel();
    }

    /// Wait until no session is registered. `false` if `timeout` ran out first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_sessions() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Removes the session from the registry however `serve` exits, including
/// when its future is dropped.
struct Registration<'a> {
    manager: &'a SessionManager,
    id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let empty = {
            let mut sessions = self.manager.lock();
            sessions.remove(&self.id);
            sessions.is_empty()
        };
        self.manager.deps.metrics.session_closed();
        if empty {
            self.manager.drained.notify_waiters();
        }
    }
}
