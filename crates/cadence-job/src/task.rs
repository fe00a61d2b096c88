//! Cancellable background tasks

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::JobError;

/// A spawned component loop plus the token that stops it
///
/// `close` cancels the loop and waits for it to exit. Closing an already
/// closed handle is a no-op.
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `future` on the runtime; it must return once `cancel` fires
    pub fn spawn<F>(name: &'static str, cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "starting");
        Self {
            name,
            cancel,
            handle: Some(tokio::spawn(future)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn close(&mut self) -> Result<(), JobError> {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.map_err(|e| {
            cadence_common::Error::internal_with_context(self.name, format!("task panicked: {}", e))
        })?;
        debug!(task = self.name, "stopped");
        Ok(())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
