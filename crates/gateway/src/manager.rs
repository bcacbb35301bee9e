//! Lifecycle of one gateway connection's tasks.
//!
//! A [`Manager`] owns the heartbeat pulse, heartbeat beat and listener tasks
//! of a single connection. The group ends when every task has returned; the
//! first error cancels the others. Before cancelling on purpose, a caller
//! records why in a set-once [`Signal`] so the supervisor can tell a clean
//! shutdown from a reconnect from a failure.

use std::{
    future::Future,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

/// Why the connection is being torn down on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Disconnect,
    Reconnect,
}

pub struct Manager {
    cancel: CancellationToken,
    signal: OnceLock<Signal>,
    tasks: Mutex<JoinSet<Result<()>>>,
    running: Arc<AtomicUsize>,
}

impl Manager {
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    /// A manager whose tasks also stop when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_cancel(parent.child_token())
    }

    fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            signal: OnceLock::new(),
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token every task of this connection selects on.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn signal(&self) -> Option<Signal> {
        self.signal.get().copied()
    }

    /// Tasks that have not returned yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Record `signal` (first one wins) without cancelling, for callers
    /// that cancel through the parent token.
    pub fn mark(&self, signal: Signal) {
        if self.signal.set(signal).is_err() {
            debug!(?signal, kept = ?self.signal(), "lifecycle signal already set");
        }
    }

    /// Record `signal` (first one wins) and cancel every task.
    pub fn stop(&self, signal: Signal) {
        self.mark(signal);
        self.cancel.cancel();
    }

    pub fn disconnect(&self) {
        self.stop(Signal::Disconnect);
    }

    pub fn reconnect(&self) {
        self.stop(Signal::Reconnect);
    }

    /// Cancel without recording a signal, e.g. after a failed handshake.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Run `task` as part of the group. An error cancels the rest.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(async move {
            let result = task.await;
            running.fetch_sub(1, Ordering::SeqCst);
            if let Err(ref err) = result {
                debug!(task = name, error = %err, "connection task failed");
                cancel.cancel();
            } else {
                debug!(task = name, "connection task finished");
            }
            result
        });
    }

    /// Wait for every task and return the first error, if any.
    pub async fn join(&self) -> Result<()> {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut first: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "connection task panicked or was aborted");
                    self.cancel.cancel();
                    Err(Error::message(format!("connection task failed: {err}")))
                },
            };
            if let Err(err) = result
                && first.is_none()
            {
                first = Some(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
