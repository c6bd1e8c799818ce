//! Token Keeper - OAuth2 credential keeper for Amazon Advertising API accounts
//!
//! Obtains, refreshes and persists Login with Amazon tokens so callers can
//! always ask for a valid access token.

pub mod auth;
pub mod config;

pub use auth::{
    ClientCredentials, ManagerSettings, ProviderConfig, TokenError, TokenManager, TokenResult,
};
pub use config::Config;
