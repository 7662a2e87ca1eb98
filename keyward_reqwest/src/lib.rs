//! Middleware to attach access tokens and recover from rejected ones
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach a
//! valid access token, obtained from a [`RefreshCoordinator`], to each
//! outbound request.
//!
//! If the server still answers `401 Unauthorized`, the middleware asks the
//! coordinator for a refreshed token and sends the request again, exactly
//! once. A request that is rejected a second time is returned to the caller
//! as is, marked with [`UnauthorizedAfterRetry`].
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place and the request will not be retried, allowing overrides to be
//! specified as required.
//!
//! ```
//! use keyward_reqwest::AccessTokenMiddleware;
//! use keyward_tokens::{refresh::oauth2::RefreshTokenGrant, ClientId, IssuerConfig, NoSession, RefreshCoordinator};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let config = IssuerConfig::new("https://auth.example.com/realms/app", ClientId::from_static("web"), None);
//! let coordinator = RefreshCoordinator::new(RefreshTokenGrant::from_config(&config).unwrap(), NoSession);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(coordinator))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! ```
//! use keyward_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use keyward_tokens::{NoSession, RefreshCoordinator};
//! use predicates::prelude::PredicateBooleanExt;
//! # use keyward_tokens::{refresh::oauth2::RefreshTokenGrant, ClientId, IssuerConfig};
//! # let config = IssuerConfig::new("https://auth.example.com/realms/app", ClientId::from_static("web"), None);
//! # let coordinator = RefreshCoordinator::new(RefreshTokenGrant::from_config(&config).unwrap(), NoSession);
//!
//! AccessTokenMiddleware::new(coordinator)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! ```

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

use std::{error, fmt, sync::Arc};

use bytes::Bytes;
use http::Extensions;
use keyward_clock::{Clock, System};
use keyward_tokens::{Credential, RefreshCoordinator};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;

/// Marks a request that has already been retried after a token refresh
///
/// Stored in the request's [`Extensions`]. A request carrying this marker is
/// never refreshed and retried again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthRetried;

/// The server rejected a request even after its access token was refreshed
///
/// Inserted into the extensions of the `401 Unauthorized` response returned
/// for the retried request.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("request was unauthorized even after refreshing the access token")]
pub struct UnauthorizedAfterRetry;

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P, C = System> {
    coordinator: RefreshCoordinator<C>,
    predicate: P,
}

impl<C> AccessTokenMiddleware<HttpsOnly, C> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator<C>) -> Self {
        Self {
            coordinator,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P, C> {
        AccessTokenMiddleware {
            coordinator: self.coordinator,
            predicate,
        }
    }
}

fn authorization_header(credential: &Credential) -> Option<header::HeaderValue> {
    tracing::trace!(
        token.r#type = %credential.token_type(),
        token.expires_at = credential.expires_at().0,
        "obtained access token"
    );

    match header::HeaderValue::from_maybe_shared(Bytes::from(credential.authorization_value())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "access token is not a valid header value, sending request without it"
            );
            None
        }
    }
}

fn attach(req: &mut Request, credential: &Credential) {
    if let Some(value) = authorization_header(credential) {
        req.headers_mut().insert(header::AUTHORIZATION, value);
    }
}

impl<P, C> AccessTokenMiddleware<P, C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn refresh_after_rejection(
        &self,
        rejected: Option<&Arc<Credential>>,
    ) -> Option<Arc<Credential>> {
        let refreshed = match rejected {
            Some(credential) => {
                self.coordinator
                    .refresh_rejected(credential.access_token())
                    .await
            }
            None => self.coordinator.refresh_access_token().await,
        };

        match refreshed {
            Ok(credential) => Some(credential),
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "unable to refresh access token after rejection"
                );
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl<P, C> Middleware for AccessTokenMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let sent = self.coordinator.get_valid_access_token().await;
        match &sent {
            Some(credential) => attach(&mut req, credential),
            None => tracing::debug!("no access token available, sending request without one"),
        }

        let already_retried = extensions.get::<AuthRetried>().is_some();
        let replay = if already_retried {
            None
        } else {
            req.try_clone()
        };

        let resp = next.clone().run(req, extensions).await?;

        if resp.status() != StatusCode::UNAUTHORIZED || already_retried {
            return Ok(resp);
        }

        let mut replay = match replay {
            Some(replay) => replay,
            None => {
                tracing::debug!("request body cannot be replayed, not retrying");
                return Ok(resp);
            }
        };

        extensions.insert(AuthRetried);

        let credential = match self.refresh_after_rejection(sent.as_ref()).await {
            Some(credential) => credential,
            None => return Ok(resp),
        };

        tracing::debug!("retrying request with refreshed access token");
        attach(&mut replay, &credential);

        let mut resp = next.run(replay, extensions).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(
                error = (&UnauthorizedAfterRetry as &dyn error::Error),
                "request rejected again after refresh"
            );
            resp.extensions_mut().insert(UnauthorizedAfterRetry);
        }

        Ok(resp)
    }
}

fn explain<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    result: bool,
    expected: bool,
    key: &'static str,
    value: String,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(key, value))
    })
}

/// Attaches access tokens only to requests sent over HTTPS
///
/// This is the default predicate of [`AccessTokenMiddleware::new()`], so a
/// token never travels in plaintext unless explicitly allowed.
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let scheme = req.url().scheme();
        explain(self, scheme == "https", expected, "scheme", scheme.to_owned())
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request is sent over https")
    }
}

/// Attaches access tokens only to requests for one API host
///
/// The comparison is exact: a token meant for `api.example.com` is not sent
/// to `example.com` or to any other subdomain. Ports are not compared.
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Matches requests whose URL host is `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let host = req.url().host_str().unwrap_or("<no host>").to_owned();
        explain(self, self.eval(req), expected, "host", host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request host is {}", self.host)
    }
}
