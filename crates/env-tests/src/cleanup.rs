//! Deferred teardown actions.
//!
//! The check registers teardown steps on a `CleanupStack` as soon as it
//! commits to creating the resources they undo, and runs the stack once the
//! body of the run has finished, whatever its outcome. A stack dropped with
//! actions still pending (the run future was cancelled) hands them to the
//! current tokio runtime.

use futures::future::BoxFuture;
use tracing::{info, warn};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// A teardown step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub name: String,
    pub error: String,
}

/// LIFO stack of named teardown actions.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupFn)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action`; it runs before everything registered earlier.
    pub fn defer<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), String>> + Send + 'static,
    {
        self.actions.push((name.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, newest first, and report the ones that failed.
    ///
    /// A failing action does not stop the remaining ones.
    pub async fn run_all(mut self) -> Vec<CleanupFailure> {
        run_actions(std::mem::take(&mut self.actions)).await
    }
}

async fn run_actions(mut actions: Vec<(String, CleanupFn)>) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();

    while let Some((name, action)) = actions.pop() {
        match action().await {
            Ok(()) => info!(action = %name, "Cleanup complete"),
            Err(error) => {
                warn!(action = %name, error = %error, "Cleanup failed");
                failures.push(CleanupFailure { name, error });
            }
        }
    }

    failures
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }

        let actions = std::mem::take(&mut self.actions);
        let pending: Vec<String> = actions.iter().map(|(n, _)| n.clone()).collect();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(pending = ?pending, "Cleanup stack dropped, running teardown in background");
                handle.spawn(run_actions(actions));
            }
            Err(_) => {
                warn!(pending = ?pending, "Cleanup stack dropped outside a runtime, teardown skipped");
            }
        }
    }
}
