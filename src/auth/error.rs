//! Error taxonomy for token management

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the token manager and its collaborators.
///
/// Each variant maps to one recovery path: re-authenticate, retry later,
/// or operator attention (storage).
#[derive(Debug, Error)]
pub enum TokenError {
    /// No token record exists for the account.
    #[error("account {account} is not authenticated; exchange an authorization code first")]
    NotAuthenticated { account: String },

    /// The provider rejected the authorization code or refresh token.
    #[error("authorization rejected by provider: {reason}")]
    Authentication { reason: String },

    /// The provider refused the request for a reason other than the grant
    /// (client credentials, scope, malformed request). Stored tokens are kept.
    #[error("request rejected by provider: {reason}")]
    Rejected { reason: String },

    /// Refresh failed transiently after exhausting retries. The previous
    /// record is still in place.
    #[error("token refresh failed after {attempts} attempt(s): {reason}")]
    Refresh { attempts: u32, reason: String },

    /// Code exchange failed transiently after exhausting retries.
    #[error("authorization code exchange failed after {attempts} attempt(s): {reason}")]
    Exchange { attempts: u32, reason: String },

    /// The persistence medium is unavailable.
    #[error("token storage error: {0}")]
    Storage(String),

    /// The persisted record exists but cannot be decrypted or parsed.
    #[error("persisted token record for {account} is unreadable: {reason}")]
    Corruption { account: String, reason: String },

    /// Ciphertext failed authentication or was malformed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The operation exceeded the caller-supplied deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TokenError {
    /// Transient failure; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Refresh { .. } | Self::Exchange { .. } | Self::Timeout(_)
        )
    }

    /// The caller has to run the authorization code flow again.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::NotAuthenticated { .. } | Self::Authentication { .. })
    }

    /// Storage or client configuration problems need someone to step in.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Corruption { .. } | Self::Decryption(_) | Self::Rejected { .. }
        )
    }
}

impl From<std::io::Error> for TokenError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type TokenResult<T> = std::result::Result<T, TokenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let refresh = TokenError::Refresh {
            attempts: 3,
            reason: "503".into(),
        };
        assert!(refresh.is_retryable());
        assert!(!refresh.requires_reauth());

        let rejected = TokenError::Authentication {
            reason: "invalid_grant".into(),
        };
        assert!(rejected.requires_reauth());
        assert!(!rejected.is_retryable());

        let storage = TokenError::from(std::io::Error::other("disk full"));
        assert!(storage.needs_operator());
        assert!(!storage.is_retryable());

        let client = TokenError::Rejected {
            reason: "invalid_client".into(),
        };
        assert!(client.needs_operator());
        assert!(!client.requires_reauth());
    }
}
