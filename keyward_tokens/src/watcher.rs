use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::Credential;

/// A subscription to refresh notifications from a [`RefreshCoordinator`][crate::RefreshCoordinator]
///
/// Each successful refresh publishes the new credential. Observers holding
/// their own copy of session state can use this to resynchronize it.
/// Only the latest credential is retained, so a slow observer sees the
/// most recent refresh rather than every one.
#[derive(Clone, Debug)]
pub struct RefreshWatcher {
    watcher: watch::Receiver<Option<Arc<Credential>>>,
}

/// The coordinator that published refreshes has been dropped
#[derive(Clone, Copy, Debug, Error)]
#[error("refresh coordinator has quit publishing")]
pub struct RefreshPublisherQuit;

impl RefreshWatcher {
    pub(crate) fn new(watcher: watch::Receiver<Option<Arc<Credential>>>) -> Self {
        Self { watcher }
    }

    /// Waits for the next successful refresh and returns its credential
    ///
    /// Refreshes that completed before this watcher was created, or that were
    /// already returned by an earlier call, are not reported again.
    pub async fn changed(&mut self) -> Result<Arc<Credential>, RefreshPublisherQuit> {
        loop {
            self.watcher
                .changed()
                .await
                .map_err(|_| RefreshPublisherQuit)?;

            if let Some(credential) = self.watcher.borrow_and_update().clone() {
                return Ok(credential);
            }
        }
    }

    /// The credential from the most recent successful refresh, if any
    pub fn latest(&self) -> Option<Arc<Credential>> {
        self.watcher.borrow().clone()
    }
}
