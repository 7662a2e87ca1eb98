use keyward_clock::{DurationMillis, UnixMillis};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, TokenType, TokenTypeRef};

/// An access token with its optional refresh token and absolute expiry
///
/// A credential is replaced wholesale on every refresh and never mutated
/// in place once it has been stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    expires_at: UnixMillis,
    #[serde(default)]
    token_type: TokenType,
}

impl Credential {
    /// Constructs a `Bearer` credential with no refresh token
    pub fn new(access_token: AccessToken, expires_at: UnixMillis) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_at,
            token_type: TokenType::default(),
        }
    }

    /// Attaches a refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Overrides the token type
    pub fn with_token_type(mut self, token_type: TokenType) -> Self {
        self.token_type = token_type;
        self
    }

    /// Keeps `previous` as the refresh token if this credential did not come with one
    ///
    /// Issuers that do not rotate refresh tokens omit them from refresh
    /// responses; the one already held stays usable.
    pub fn retaining_refresh_token(mut self, previous: Option<&RefreshTokenRef>) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.map(ToOwned::to_owned);
        }
        self
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token, if one is held
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the instant at which the issuer stops accepting the access token
    #[inline]
    pub fn expires_at(&self) -> UnixMillis {
        self.expires_at
    }

    /// Gets the token type
    #[inline]
    pub fn token_type(&self) -> &TokenTypeRef {
        &self.token_type
    }

    /// How much longer the access token remains valid as of `now`
    #[inline]
    pub fn until_expired_at(&self, now: UnixMillis) -> DurationMillis {
        self.expires_at.saturating_since(now)
    }

    /// Renders the `Authorization` header value, `<token type> <access token>`
    pub fn authorization_value(&self) -> String {
        let token_type = self.token_type.as_str();
        let access_token = self.access_token.as_str();
        let mut value = String::with_capacity(token_type.len() + access_token.len() + 1);
        value.push_str(token_type);
        value.push(' ');
        value.push_str(access_token);
        value
    }
}
