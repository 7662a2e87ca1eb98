//! Keeping an API client supplied with a valid access token
//!
//! This library caches a client's credential in memory and refreshes it
//! transparently when it is about to expire. However many tasks ask for a
//! token at the same time, at most one refresh is ever in flight: the first
//! caller to find the credential expired performs the refresh and every
//! other caller waits for, and shares, its outcome.
//!
//! A credential is treated as expired slightly before the issuer would
//! reject it (see [`ExpiryPolicy`]), so that a token does not run out while
//! a request carrying it is still on the wire.
//!
//! # General Flow
//!
//! On application start-up, construct a single [`RefreshCoordinator`] from a
//! [`TokenRefresher`] that knows how to talk to the issuer and a
//! [`SessionBridge`] to the externally managed session. Hand clones of the
//! coordinator to everything that needs a token.
//!
//! ```
//! use keyward_tokens::{
//!     refresh::oauth2::RefreshTokenGrant, ClientId, ClientSecret, IssuerConfig, NoSession,
//!     RefreshCoordinator,
//! };
//!
//! let config = IssuerConfig::new(
//!     "https://auth.example.com/realms/app",
//!     ClientId::from_static("web"),
//!     Some(ClientSecret::from_static("secret")),
//! );
//!
//! let grant = RefreshTokenGrant::from_config(&config).unwrap();
//! let coordinator = RefreshCoordinator::new(grant, NoSession);
//!
//! # async move {
//! if let Some(credential) = coordinator.get_valid_access_token().await {
//!     tracing::info!(
//!         token = format_args!("{:#?}", credential.access_token()),
//!         "obtained access token"
//!     );
//! }
//! # };
//! ```
//!
//! When the issuer refuses to refresh, the coordinator terminates the
//! session through the [`SessionBridge`] exactly once, and every caller
//! waiting on that refresh sees the same failure.
//!
//! # Features
//!
//! * `oauth2` (default): Provides [`RefreshTokenGrant`][refresh::oauth2::RefreshTokenGrant],
//!   which performs the OAuth2 refresh token grant using [reqwest], and
//!   [`IssuerConfig`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
#[cfg(feature = "oauth2")]
mod config;
mod coordinator;
mod error;
mod expiry;
pub mod refresh;
mod session;
mod store;
mod tokens;
mod watcher;

pub use braids::*;
#[cfg(feature = "oauth2")]
pub use config::{ConfigError, IssuerConfig, DEFAULT_REQUEST_TIMEOUT};
pub use coordinator::{RefreshCoordinator, RefreshCoordinatorBuilder, RefreshState};
pub use error::{BoxError, RefreshError};
pub use expiry::{ExpiryPolicy, DEFAULT_EXPIRY_MARGIN, DEFAULT_FALLBACK_LIFETIME};
pub use refresh::{IssuedToken, TokenRefresher};
pub use session::{NoSession, Session, SessionBridge};
pub use store::TokenStore;
pub use tokens::Credential;
pub use watcher::{RefreshPublisherQuit, RefreshWatcher};
