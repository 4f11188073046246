//! Detached work that outlives the response it was triggered by.
//!
//! Tasks are tracked so shutdown can give them a bounded grace period. There is
//! no completion guarantee beyond that.

use std::{future::Future, time::Duration};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info_span, warn};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` detached from the caller. Nothing observes its completion.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker
            .spawn(task.instrument(info_span!("background", task = name)));
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task spawned so far, then accept new work again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Drain with an upper bound. Returns `false` if tasks were still running
    /// when `grace` elapsed; those are abandoned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.drain()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.pending(),
                    "background tasks still running after {:?}, abandoning",
                    grace
                );
                false
            }
        }
    }
}
