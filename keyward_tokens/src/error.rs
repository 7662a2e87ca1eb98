use std::error;

use thiserror::Error;

/// A boxed error returned by collaborators such as a [`SessionBridge`][crate::SessionBridge]
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error while attempting to obtain a fresh access token
///
/// A single instance is shared, behind an [`Arc`][std::sync::Arc], by every
/// caller that waited on the same refresh.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// No refresh token is cached and none could be obtained from the session
    #[error("no refresh token available")]
    NoRefreshToken,
    /// The issuer answered the refresh grant with a non-success status
    #[error("issuer rejected refresh with status {status}: {body}")]
    RefreshRequestFailed {
        /// The HTTP status returned by the issuer
        status: u16,
        /// The body of the error response
        body: String,
    },
    /// The refresh request could not be sent or its response could not be read
    #[error("error communicating with issuer")]
    Transport(#[source] BoxError),
    /// The issuer returned a success status with a body that is not a token response
    #[error("error deserializing token body from issuer")]
    MalformedResponse(#[source] serde_json::Error),
    /// The externally managed session could not be retrieved
    #[error("unable to fetch session")]
    SessionFetchFailed(#[source] BoxError),
    /// The task driving the refresh was dropped before the refresh settled
    #[error("refresh was abandoned before completing")]
    Abandoned,
}

impl RefreshError {
    /// Whether this failure means the session can no longer be recovered
    ///
    /// An abandoned refresh says nothing about the credentials and does not
    /// end the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }
}
