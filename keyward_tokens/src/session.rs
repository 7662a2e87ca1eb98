//! The externally managed session

use std::sync::Arc;

use async_trait::async_trait;

use crate::{AccessToken, BoxError, RefreshToken};

/// Tokens held by an externally managed session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    /// The session's access token, if it carries one
    pub access_token: Option<AccessToken>,
    /// The session's refresh token, if it carries one
    pub refresh_token: Option<RefreshToken>,
}

/// A bridge to the session managed outside of this client
///
/// The session is the source of truth when no credential is cached and the
/// place to send the user when credentials can no longer be refreshed.
#[async_trait]
pub trait SessionBridge: Send + Sync {
    /// Retrieves the current session, if there is one
    async fn fetch_session(&self) -> Result<Option<Session>, BoxError>;

    /// Ends the session and sends the user back to authenticate
    async fn terminate_session(&self);
}

#[async_trait]
impl<T: SessionBridge + ?Sized> SessionBridge for Arc<T> {
    async fn fetch_session(&self) -> Result<Option<Session>, BoxError> {
        (**self).fetch_session().await
    }

    async fn terminate_session(&self) {
        (**self).terminate_session().await
    }
}

/// A session bridge for clients without an external session
///
/// Never yields a session. Termination is only logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSession;

#[async_trait]
impl SessionBridge for NoSession {
    async fn fetch_session(&self) -> Result<Option<Session>, BoxError> {
        Ok(None)
    }

    async fn terminate_session(&self) {
        tracing::info!("session terminated");
    }
}
