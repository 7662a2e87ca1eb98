//! DTOs for the OAuth2 refresh token grant

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ClientIdRef, ClientSecretRef, RefreshToken, RefreshTokenRef, TokenType};

/// The form body of a refresh token grant
#[derive(Debug)]
pub(super) struct RefreshGrantRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub client_secret: Option<&'a ClientSecretRef>,
    pub refresh_token: &'a RefreshTokenRef,
}

impl Serialize for RefreshGrantRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshGrantRequest", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.serialize_field("client_id", self.client_id)?;
        if let Some(secret) = self.client_secret {
            ser.serialize_field("client_secret", secret)?;
        } else {
            ser.skip_field("client_secret")?;
        }
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<TokenType>,
}
