//! A refresher that uses an OAuth2 issuer's refresh token grant

use async_trait::async_trait;
use keyward_clock::DurationMillis;

use super::{IssuedToken, TokenRefresher};
use crate::{ClientId, ClientSecret, ConfigError, IssuerConfig, RefreshError, RefreshTokenRef};

mod dto;

/// Exchanges refresh tokens at an OAuth2 token endpoint
///
/// Credentials are sent as `application/x-www-form-urlencoded` form data.
#[derive(Debug)]
pub struct RefreshTokenGrant {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
}

impl RefreshTokenGrant {
    /// Constructs a new refresh token grant
    ///
    /// Any request timeout is the responsibility of `client`.
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
    ) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret,
        }
    }

    /// Constructs a refresh token grant against the issuer named in `config`
    ///
    /// The HTTP client is built with the configured request timeout.
    pub fn from_config(config: &IssuerConfig) -> Result<Self, ConfigError> {
        let token_url = config.token_endpoint()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout().into())
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self::new(
            client,
            token_url,
            config.client_id().to_owned(),
            config.client_secret().map(ToOwned::to_owned),
        ))
    }

    /// The token endpoint this grant is sent to
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }
}

#[async_trait]
impl TokenRefresher for RefreshTokenGrant {
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedToken, RefreshError> {
        request_token(
            &self.client,
            self.token_url.clone(),
            dto::RefreshGrantRequest {
                client_id: &self.client_id,
                client_secret: self.client_secret.as_deref(),
                refresh_token,
            },
        )
        .await
    }
}

#[tracing::instrument(
    err,
    skip(client, token_url, credentials),
    fields(
        token_url = %token_url,
        credentials.client_id = %credentials.client_id,
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    credentials: dto::RefreshGrantRequest<'_>,
) -> Result<IssuedToken, RefreshError> {
    tracing::trace!("requesting token from issuer");

    let resp = client
        .post(token_url)
        .form(&credentials)
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.into()))?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuer"
    );

    if !status.is_success() {
        let body = resp
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.into()))?;
        return Err(RefreshError::RefreshRequestFailed {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| RefreshError::Transport(e.into()))?;
    let resp: dto::TokenResponse =
        serde_json::from_slice(&body).map_err(RefreshError::MalformedResponse)?;

    tracing::info!(
        has_refresh_token = resp.refresh_token.is_some(),
        expires_in = ?resp.expires_in,
        "received new tokens"
    );

    Ok(IssuedToken {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token,
        expires_in: resp.expires_in.map(DurationMillis::from_secs),
        token_type: resp.token_type,
    })
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::RefreshToken;

    const TOKEN_PATH: &str = "/realms/app/protocol/openid-connect/token";

    fn grant(server: &MockServer) -> RefreshTokenGrant {
        let config = IssuerConfig::new(
            format!("{}/realms/app", server.uri()),
            ClientId::from_static("web"),
            Some(ClientSecret::from_static("s3cret")),
        );
        RefreshTokenGrant::from_config(&config).unwrap()
    }

    fn refresh_token() -> RefreshToken {
        RefreshToken::from_static("rt-1")
    }

    #[tokio::test]
    async fn sends_refresh_grant_as_form_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("client_id=web"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let issued = grant(&server).refresh(&refresh_token()).await.unwrap();

        assert_eq!(issued.access_token.as_str(), "abc");
        assert_eq!(issued.expires_in, Some(DurationMillis(3_600_000)));
        assert_eq!(issued.refresh_token, None);
        assert_eq!(issued.token_type, None);
    }

    #[tokio::test]
    async fn reads_rotated_refresh_token_and_token_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "refresh_token": "rt-2",
                "expires_in": 300,
                "token_type": "Bearer",
            })))
            .mount(&server)
            .await;

        let issued = grant(&server).refresh(&refresh_token()).await.unwrap();

        assert_eq!(issued.refresh_token.as_deref().map(|r| r.as_str()), Some("rt-2"));
        assert_eq!(issued.token_type.as_deref().map(|t| t.as_str()), Some("Bearer"));
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let error = grant(&server).refresh(&refresh_token()).await.unwrap_err();

        match error {
            RefreshError::RefreshRequestFailed { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, r#"{"error":"invalid_grant"}"#);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn success_without_access_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let error = grant(&server).refresh(&refresh_token()).await.unwrap_err();

        assert!(matches!(error, RefreshError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_issuer_is_a_transport_error() {
        let config = IssuerConfig::new(
            "http://127.0.0.1:1/realms/app",
            ClientId::from_static("web"),
            None,
        );
        let grant = RefreshTokenGrant::from_config(&config).unwrap();

        let error = grant.refresh(&refresh_token()).await.unwrap_err();

        assert!(matches!(error, RefreshError::Transport(_)));
    }
}
