// Error handling module
// Defines the authentication error taxonomy surfaced to callers

use thiserror::Error;

/// Errors that can occur while obtaining or refreshing a session token
#[derive(Error, Debug)]
pub enum AuthError {
    /// Network-level failure reaching the identity endpoint
    #[error("identity endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// Unexpected response from the identity endpoint (non-200 without a
    /// recognizable OAuth error body)
    #[error("identity endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    /// The identity provider explicitly rejected the refresh token
    /// (revoked or inactive session)
    #[error("refresh token rejected by identity provider: {0}")]
    InvalidGrant(String),

    /// The identity provider rejected the username/password pair
    #[error("identity provider rejected credentials: {0}")]
    InvalidCredentials(String),

    /// The password grant is pending a one-time code; the caller should
    /// prompt for the emailed code and retry
    #[error("one-time code required: {0}")]
    OtpRequired(String),

    /// Both the refresh and credential strategies were exhausted
    #[error("authentication failed: neither token refresh nor credential login succeeded")]
    AuthenticationFailed,
}

impl AuthError {
    /// True for provider responses that invalidate the stored refresh token.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, AuthError::InvalidGrant(_))
    }

    /// True for failures of the password grant that the caller must resolve
    /// (wrong credentials or a pending one-time code); these are surfaced
    /// as-is instead of being folded into `AuthenticationFailed`.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials(_) | AuthError::OtpRequired(_)
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;
