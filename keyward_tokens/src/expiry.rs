use keyward_clock::{DurationMillis, UnixMillis};

use crate::{claims, AccessTokenRef, Credential};

/// Default window before expiry in which a credential is already treated as expired
pub const DEFAULT_EXPIRY_MARGIN: DurationMillis = DurationMillis(60_000);

/// Default lifetime assumed for an access token whose expiry cannot be determined
///
/// This is deliberately shorter than the hour most issuers grant.
pub const DEFAULT_FALLBACK_LIFETIME: DurationMillis = DurationMillis::from_mins(55);

/// Decides when a cached credential must no longer be used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    margin: DurationMillis,
    fallback_lifetime: DurationMillis,
}

impl Default for ExpiryPolicy {
    /// Default expiry policy
    ///
    /// Uses a margin of 60 seconds and a fallback lifetime of 55 minutes.
    fn default() -> Self {
        Self {
            margin: DEFAULT_EXPIRY_MARGIN,
            fallback_lifetime: DEFAULT_FALLBACK_LIFETIME,
        }
    }
}

impl ExpiryPolicy {
    /// Constructs a new expiry policy
    ///
    /// A credential is considered expired once less than `margin` remains
    /// before its expiry. Tokens that carry no derivable expiry are assumed
    /// to live for `fallback_lifetime`.
    pub const fn new(margin: DurationMillis, fallback_lifetime: DurationMillis) -> Self {
        Self {
            margin,
            fallback_lifetime,
        }
    }

    /// Replaces the margin
    pub const fn with_margin(mut self, margin: DurationMillis) -> Self {
        self.margin = margin;
        self
    }

    /// Replaces the fallback lifetime
    pub const fn with_fallback_lifetime(mut self, fallback_lifetime: DurationMillis) -> Self {
        self.fallback_lifetime = fallback_lifetime;
        self
    }

    /// The margin before expiry
    #[inline]
    pub const fn margin(&self) -> DurationMillis {
        self.margin
    }

    /// The lifetime assumed when none is known
    #[inline]
    pub const fn fallback_lifetime(&self) -> DurationMillis {
        self.fallback_lifetime
    }

    /// Whether `credential` must be treated as expired at `now`
    ///
    /// An absent credential is always expired. Otherwise the credential is
    /// expired when `expires_at - now < margin`.
    pub fn is_expired(&self, credential: Option<&Credential>, now: UnixMillis) -> bool {
        match credential {
            None => true,
            Some(credential) => credential.expires_at() < now + self.margin,
        }
    }

    /// Reads the expiry from the token's own claims, if it has any
    #[inline]
    pub fn derive_expiry(&self, access_token: &AccessTokenRef) -> Option<UnixMillis> {
        claims::derive_expiry(access_token)
    }

    /// The expiry to record for a token obtained at `now` with no explicit lifetime
    ///
    /// Prefers the token's `exp` claim and falls back to `now` plus the
    /// fallback lifetime.
    pub fn expiry_for(&self, access_token: &AccessTokenRef, now: UnixMillis) -> UnixMillis {
        self.derive_expiry(access_token)
            .unwrap_or_else(|| now + self.fallback_lifetime)
    }
}
