//! OAuth2 credential management for Amazon Advertising API accounts
//!
//! Implements the authorization code flow against Login with Amazon,
//! keeps access tokens fresh and persists them encrypted at rest.

pub mod cipher;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tokens;

pub use cipher::TokenCipher;
pub use clock::{Clock, SystemClock};
pub use endpoint::{EndpointError, OAuthTokenEndpoint, RawTokenResponse, TokenEndpoint};
pub use error::{TokenError, TokenResult};
pub use manager::{ManagerSettings, TokenManager};
pub use retry::RetryPolicy;
pub use scheduler::{RefreshScheduler, SchedulerHandle};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use tokens::{TokenInfo, TokenRecord, TokenStatus};

/// Login with Amazon endpoints for one marketplace region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// OAuth2 token endpoint (code and refresh exchanges)
    pub token_url: String,
    /// Consent page the user is sent to
    pub authorize_url: String,
    /// Requested scope
    pub scope: String,
}

impl ProviderConfig {
    pub const DEFAULT_SCOPE: &'static str = "advertising::campaign_management";

    /// North America
    pub fn north_america() -> Self {
        Self {
            token_url: "https://api.amazon.com/auth/o2/token".into(),
            authorize_url: "https://www.amazon.com/ap/oa".into(),
            scope: Self::DEFAULT_SCOPE.into(),
        }
    }

    /// Europe
    pub fn europe() -> Self {
        Self {
            token_url: "https://api.amazon.co.uk/auth/o2/token".into(),
            authorize_url: "https://eu.account.amazon.com/ap/oa".into(),
            scope: Self::DEFAULT_SCOPE.into(),
        }
    }

    /// Far East
    pub fn far_east() -> Self {
        Self {
            token_url: "https://api.amazon.co.jp/auth/o2/token".into(),
            authorize_url: "https://apac.account.amazon.com/ap/oa".into(),
            scope: Self::DEFAULT_SCOPE.into(),
        }
    }

    /// Preset by region code (`na`, `eu`, `fe`)
    pub fn for_region(region: &str) -> Option<Self> {
        match region.to_ascii_lowercase().as_str() {
            "na" => Some(Self::north_america()),
            "eu" => Some(Self::europe()),
            "fe" => Some(Self::far_east()),
            _ => None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::north_america()
    }
}

/// Registered application credentials sent with every exchange
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Must match the redirect URI registered with the application
    pub redirect_uri: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_presets() {
        assert_eq!(
            ProviderConfig::for_region("NA"),
            Some(ProviderConfig::north_america())
        );
        assert!(ProviderConfig::for_region("eu")
            .unwrap()
            .token_url
            .contains("amazon.co.uk"));
        assert!(ProviderConfig::for_region("mars").is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ClientCredentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
            redirect_uri: "https://localhost".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
