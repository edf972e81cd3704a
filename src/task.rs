use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use log::warn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned task that is told to stop when its owner goes away.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::task::spawn(task(self.token.clone()));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the task to finish. Does not cancel it.
    pub(crate) async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("background task failed, reason: {}", err);
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let spawned = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if spawned {
            self.token.cancel();
        }
    }
}
