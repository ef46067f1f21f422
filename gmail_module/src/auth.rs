//! OAuth2 refresh-token exchange. The service is handed a long-lived
//! refresh token via configuration; the interactive consent flow is out
//! of scope.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::MailError;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct GoogleAuth {
    http: reqwest::blocking::Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: String,
}

impl GoogleAuth {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self::with_token_uri(client_id, client_secret, refresh_token, TOKEN_URI)
    }

    pub fn with_token_uri(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        token_uri: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_uri: token_uri.into(),
        }
    }

    /// Exchange the refresh token for a fresh bearer access token.
    pub fn access_token(&self) -> Result<String, MailError> {
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            let lowered = body.to_lowercase();
            if status.as_u16() == 400 || status.as_u16() == 401 {
                if lowered.contains("invalid_grant") || lowered.contains("expired") {
                    return Err(MailError::Auth(format!(
                        "refresh token rejected: HTTP {status}: {body}"
                    )));
                }
            }
            return Err(MailError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let payload: Value = serde_json::from_str(&body)
            .map_err(|err| MailError::BadResponse(err.to_string()))?;
        match payload["access_token"].as_str() {
            Some(token) if !token.is_empty() => {
                debug!("refreshed google access token");
                Ok(token.to_string())
            }
            _ => Err(MailError::Auth(
                "token endpoint returned no access_token".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchanges_refresh_token_for_access_token() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token": "ya29.fresh", "expires_in": 3599}"#)
            .create();

        let auth = GoogleAuth::with_token_uri("cid", "secret", "1//r", format!("{}/token", server.url()));
        assert_eq!(auth.access_token().expect("token"), "ya29.fresh");
        mock.assert();
    }

    #[test]
    fn invalid_grant_maps_to_auth_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create();

        let auth = GoogleAuth::with_token_uri("cid", "secret", "1//r", format!("{}/token", server.url()));
        let err = auth.access_token().expect_err("auth error");
        assert!(matches!(err, MailError::Auth(_)));
    }

    #[test]
    fn missing_access_token_is_an_auth_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"expires_in": 3599}"#)
            .create();

        let auth = GoogleAuth::with_token_uri("cid", "secret", "1//r", format!("{}/token", server.url()));
        assert!(matches!(auth.access_token(), Err(MailError::Auth(_))));
    }
}
