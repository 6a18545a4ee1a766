// Session and wire types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A coherent token pair obtained from the identity endpoint.
///
/// A session is either empty (`Option::<TokenSet>::None`) or holds all four
/// fields; there is no partially-populated state.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub access_expiry: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expiry: DateTime<Utc>,
}

impl TokenSet {
    /// Build a token set from a grant response, anchoring both expiries at `now`.
    pub fn from_grant(grant: TokenGrant, now: DateTime<Utc>) -> Self {
        Self {
            access_token: grant.access_token,
            access_expiry: now + Duration::seconds(grant.expires_in as i64),
            refresh_token: grant.refresh_token,
            refresh_expiry: now + Duration::seconds(grant.refresh_expires_in as i64),
        }
    }

    pub fn access_valid(&self, now: DateTime<Utc>) -> bool {
        self.access_expiry > now
    }

    pub fn refresh_valid(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expiry > now
    }
}

/// Successful token response from the identity endpoint (both grant types)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

/// OAuth error body returned with non-200 responses
#[derive(Debug, Deserialize)]
pub struct IdentityFailure {
    pub error: String,
    pub error_description: Option<String>,
}

/// Durable projection of a session, written as a single record owned by the
/// account it was minted for. Field names are the store's stable format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub username: String,
    pub refresh_token: String,
    pub refresh_token_expiration: DateTime<Utc>,
    pub access_token: String,
    pub access_token_expiration: DateTime<Utc>,
}

impl PersistedSession {
    pub fn new(username: &str, tokens: &TokenSet) -> Self {
        Self {
            username: username.to_string(),
            refresh_token: tokens.refresh_token.clone(),
            refresh_token_expiration: tokens.refresh_expiry,
            access_token: tokens.access_token.clone(),
            access_token_expiration: tokens.access_expiry,
        }
    }

    pub fn into_token_set(self) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            access_expiry: self.access_token_expiration,
            refresh_token: self.refresh_token,
            refresh_expiry: self.refresh_token_expiration,
        }
    }
}
