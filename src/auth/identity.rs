// HTTP transport to the Nimbus identity endpoint

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::error::AuthError;

use super::types::{IdentityFailure, TokenGrant};

/// Token endpoint of the Nimbus identity provider
pub const DEFAULT_TOKEN_URL: &str =
    "https://id.nimbushome.com/auth/realms/nimbus/protocol/openid-connect/token";

/// OAuth client id registered for this integration
const CLIENT_ID: &str = "nimbus-app";

/// Maximum length of an endpoint error body carried into error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Which grant a request carried; drives failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    Password,
    Refresh,
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Stateless client for the two grant shapes the identity endpoint accepts.
pub struct IdentityClient {
    client: Client,
    token_url: String,
}

impl IdentityClient {
    pub fn new(token_url: impl Into<String>, connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let fingerprint = get_machine_fingerprint();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(format!("NimbusSession/{}-{}", env!("CARGO_PKG_VERSION"), fingerprint))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token_url: token_url.into(),
        })
    }

    /// Exchange username/password (and a one-time code, if present) for tokens.
    pub async fn password_grant(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> std::result::Result<TokenGrant, AuthError> {
        let mut form = vec![
            ("grant_type", "password"),
            ("client_id", CLIENT_ID),
            ("username", username),
            ("password", password),
        ];
        if let Some(code) = otp {
            form.push(("totp", code));
        }

        self.token_request(GrantKind::Password, &form).await
    }

    /// Exchange a refresh token for a new token pair.
    pub async fn refresh_grant(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("refresh_token", refresh_token),
        ];

        self.token_request(GrantKind::Refresh, &form).await
    }

    async fn token_request(
        &self,
        kind: GrantKind,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenGrant, AuthError> {
        tracing::debug!(?kind, url = %self.token_url, "Sending token request");

        let response = self.client.post(&self.token_url).form(form).send().await?;

        let status = response.status();
        if status.is_success() {
            let grant: TokenGrant = response.json().await?;
            return Ok(grant);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(?kind, status = status.as_u16(), body = %truncate_body(&body), "Token request rejected");

        Err(classify_failure(kind, status.as_u16(), &body))
    }
}

/// Map a non-200 endpoint response onto the error taxonomy.
///
/// `invalid_grant` on a refresh means the session was revoked; on a password
/// grant it means either bad credentials or a pending one-time code,
/// distinguished by the provider's description.
pub fn classify_failure(kind: GrantKind, status: u16, body: &str) -> AuthError {
    if let Ok(failure) = serde_json::from_str::<IdentityFailure>(body) {
        if failure.error == "invalid_grant" {
            let description = failure
                .error_description
                .unwrap_or_else(|| "no description".to_string());

            return match kind {
                GrantKind::Refresh => AuthError::InvalidGrant(description),
                GrantKind::Password => {
                    if mentions_one_time_code(&description) {
                        AuthError::OtpRequired(description)
                    } else {
                        AuthError::InvalidCredentials(description)
                    }
                }
            };
        }
    }

    AuthError::Endpoint {
        status,
        message: truncate_body(body),
    }
}

fn mentions_one_time_code(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("totp") || lower.contains("one-time") || lower.contains("one time")
}

/// Truncate a response body to avoid carrying excessive data in errors
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        format!(
            "{}... (truncated, {} total bytes)",
            &body[..MAX_ERROR_BODY_LENGTH],
            body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_invalid_grant_classification() {
        let body = r#"{"error":"invalid_grant","error_description":"Session not active"}"#;
        let err = classify_failure(GrantKind::Refresh, 400, body);
        assert!(matches!(err, AuthError::InvalidGrant(ref d) if d == "Session not active"));
    }

    #[test]
    fn test_password_invalid_credentials_classification() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid user credentials"}"#;
        let err = classify_failure(GrantKind::Password, 401, body);
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
    }

    #[test]
    fn test_password_otp_classification() {
        let body = r#"{"error":"invalid_grant","error_description":"Account requires a one-time code (TOTP)"}"#;
        let err = classify_failure(GrantKind::Password, 401, body);
        assert!(matches!(err, AuthError::OtpRequired(_)));

        let body = r#"{"error":"invalid_grant","error_description":"Invalid totp"}"#;
        let err = classify_failure(GrantKind::Password, 401, body);
        assert!(matches!(err, AuthError::OtpRequired(_)));
    }

    #[test]
    fn test_unrecognized_body_maps_to_endpoint_error() {
        let err = classify_failure(GrantKind::Refresh, 502, "<html>Bad Gateway</html>");
        match err {
            AuthError::Endpoint { status, message } => {
                assert_eq!(status, 502);
                assert!(message.contains("Bad Gateway"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_body_caps_length() {
        let long = "x".repeat(2000);
        let truncated = truncate_body(&long);
        assert!(truncated.len() < 600);
        assert!(truncated.contains("truncated, 2000 total bytes"));

        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn test_machine_fingerprint_is_hex() {
        let fp = get_machine_fingerprint();
        assert!(!fp.is_empty());
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
