//! Exchanging a refresh token for a new access token

use std::sync::Arc;

use async_trait::async_trait;
use keyward_clock::{DurationMillis, UnixMillis};

use crate::{
    AccessToken, Credential, ExpiryPolicy, RefreshError, RefreshToken, RefreshTokenRef, TokenType,
};

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// Tokens returned by the issuer in answer to a refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    /// The new access token
    pub access_token: AccessToken,
    /// A rotated refresh token, if the issuer sent one
    pub refresh_token: Option<RefreshToken>,
    /// How long the access token is valid for, if the issuer said
    pub expires_in: Option<DurationMillis>,
    /// The token type, if the issuer named one
    pub token_type: Option<TokenType>,
}

impl IssuedToken {
    /// An issued access token with no additional information
    pub fn new(access_token: AccessToken) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_in: None,
            token_type: None,
        }
    }

    /// Sets the lifetime reported by the issuer
    pub fn with_expires_in(mut self, expires_in: DurationMillis) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Sets the rotated refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Converts the issued token into a credential received at `now`
    ///
    /// The expiry is `now + expires_in` when the issuer reported a lifetime.
    /// Otherwise it comes from the token's claims or the policy's fallback
    /// lifetime. `previous` is kept if no new refresh token was issued.
    pub fn into_credential(
        self,
        policy: &ExpiryPolicy,
        now: UnixMillis,
        previous: Option<&RefreshTokenRef>,
    ) -> Credential {
        let expires_at = match self.expires_in {
            Some(lifetime) => now + lifetime,
            None => policy.expiry_for(&self.access_token, now),
        };

        let mut credential = Credential::new(self.access_token, expires_at);
        if let Some(refresh_token) = self.refresh_token {
            credential = credential.with_refresh_token(refresh_token);
        }
        if let Some(token_type) = self.token_type {
            credential = credential.with_token_type(token_type);
        }
        credential.retaining_refresh_token(previous)
    }
}

/// A source of fresh access tokens
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchanges `refresh_token` for a new access token
    ///
    /// Implementations make a single attempt and report any failure as is.
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedToken, RefreshError>;
}

#[async_trait]
impl<T: TokenRefresher + ?Sized> TokenRefresher for Arc<T> {
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedToken, RefreshError> {
        (**self).refresh(refresh_token).await
    }
}
