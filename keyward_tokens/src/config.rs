//! Configuration of the token issuer

use keyward_clock::DurationMillis;
use serde::Deserialize;
use thiserror::Error;

use crate::{ClientId, ClientIdRef, ClientSecret, ClientSecretRef};

/// Default timeout applied to requests sent to the issuer
pub const DEFAULT_REQUEST_TIMEOUT: DurationMillis = DurationMillis::from_secs(30);

const TOKEN_ENDPOINT_PATH: &str = "protocol/openid-connect/token";

/// An error in the issuer configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The issuer URL could not be parsed
    #[error("invalid issuer url {url:?}: {reason}")]
    InvalidIssuerUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },
    /// The issuer URL is not `http` or `https`
    #[error("issuer url must use http or https, not {0:?}")]
    UnsupportedScheme(String),
    /// The HTTP client could not be constructed
    #[error("unable to build http client")]
    HttpClient(#[source] reqwest::Error),
}

/// Where and as whom to refresh tokens
///
/// Typically read from the environment at start-up; the type can also be
/// deserialized from any configuration source supported by `serde`.
#[derive(Clone, Debug, Deserialize)]
pub struct IssuerConfig {
    issuer_url: String,
    client_id: ClientId,
    #[serde(default)]
    client_secret: Option<ClientSecret>,
    #[serde(default = "default_request_timeout")]
    request_timeout: DurationMillis,
}

fn default_request_timeout() -> DurationMillis {
    DEFAULT_REQUEST_TIMEOUT
}

impl IssuerConfig {
    /// Constructs a new issuer configuration
    ///
    /// `issuer_url` is the issuer's base URL, such as
    /// `https://auth.example.com/realms/app`.
    pub fn new(
        issuer_url: impl Into<String>,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
    ) -> Self {
        Self {
            issuer_url: issuer_url.into(),
            client_id,
            client_secret,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replaces the request timeout
    pub fn with_request_timeout(mut self, request_timeout: DurationMillis) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// The issuer's base URL
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    /// The client ID
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The client secret, if the client has one
    pub fn client_secret(&self) -> Option<&ClientSecretRef> {
        self.client_secret.as_deref()
    }

    /// The timeout applied to each request to the issuer
    pub fn request_timeout(&self) -> DurationMillis {
        self.request_timeout
    }

    /// The issuer's token endpoint, `{issuer}/protocol/openid-connect/token`
    pub fn token_endpoint(&self) -> Result<reqwest::Url, ConfigError> {
        let raw = format!(
            "{}/{}",
            self.issuer_url.trim_end_matches('/'),
            TOKEN_ENDPOINT_PATH
        );

        let url = reqwest::Url::parse(&raw).map_err(|e| ConfigError::InvalidIssuerUrl {
            url: self.issuer_url.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }
}
