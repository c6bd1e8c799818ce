//! Configuration and credential settings

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::manager::MAX_REFRESH_BUFFER;
use crate::auth::{ClientCredentials, ManagerSettings, ProviderConfig, RetryPolicy};

const ENV_CLIENT_ID: &str = "TOKEN_KEEPER_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "TOKEN_KEEPER_CLIENT_SECRET";
const ENV_ENCRYPTION_KEY: &str = "TOKEN_KEEPER_ENCRYPTION_KEY";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Login with Amazon application client ID
    pub client_id: Option<String>,
    /// Login with Amazon application client secret
    pub client_secret: Option<String>,
    /// Redirect URI registered with the application
    pub redirect_uri: String,
    /// Marketplace region preset: na, eu or fe
    pub region: String,
    pub scope: String,
    /// Overrides the region's token endpoint
    pub token_endpoint: Option<String>,
    /// Overrides the region's consent page
    pub authorize_endpoint: Option<String>,
    /// Seconds before expiry at which a token is refreshed
    pub refresh_buffer_secs: u64,
    /// Per-HTTP-request timeout
    pub request_timeout_secs: u64,
    /// Overall bound on one manager operation, retries included
    pub operation_timeout_secs: Option<u64>,
    /// Key material for token files; the client secret is used when unset
    pub encryption_key: Option<String>,
    /// Where token files live; defaults to the platform data directory
    pub storage_dir: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: "https://localhost".into(),
            region: "na".into(),
            scope: ProviderConfig::DEFAULT_SCOPE.into(),
            token_endpoint: None,
            authorize_endpoint: None,
            refresh_buffer_secs: 300,
            request_timeout_secs: 30,
            operation_timeout_secs: None,
            encryption_key: None,
            storage_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

/// `[retry]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "token-keeper", "token-keeper")
            .context("Could not determine config directory")
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from disk, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Contains the client secret
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key| var(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_CLIENT_ID) {
            self.client_id = Some(v);
        }
        if let Some(v) = non_empty(ENV_CLIENT_SECRET) {
            self.client_secret = Some(v);
        }
        if let Some(v) = non_empty(ENV_ENCRYPTION_KEY) {
            self.encryption_key = Some(v);
        }
    }

    /// Check that everything needed to talk to the provider is present
    pub fn validate(&self) -> Result<()> {
        if self.client_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
            bail!(
                "client_id is not set (add it to {} or set {})",
                Self::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "config.toml".into()),
                ENV_CLIENT_ID
            );
        }
        if self.client_secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
            bail!("client_secret is not set (set it in config.toml or {})", ENV_CLIENT_SECRET);
        }
        if self.redirect_uri.trim().is_empty() {
            bail!("redirect_uri must not be empty");
        }
        if self.refresh_buffer_secs > MAX_REFRESH_BUFFER.as_secs() {
            bail!(
                "refresh_buffer_secs must be at most {}",
                MAX_REFRESH_BUFFER.as_secs()
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if self.operation_timeout_secs == Some(0) {
            bail!("operation_timeout_secs must be positive");
        }
        self.provider()?;
        Ok(())
    }

    /// Region preset with any endpoint overrides applied
    pub fn provider(&self) -> Result<ProviderConfig> {
        let mut provider = ProviderConfig::for_region(&self.region)
            .with_context(|| format!("Unknown region '{}' (expected na, eu or fe)", self.region))?;
        if let Some(url) = &self.token_endpoint {
            provider.token_url = url.clone();
        }
        if let Some(url) = &self.authorize_endpoint {
            provider.authorize_url = url.clone();
        }
        provider.scope = self.scope.clone();
        Ok(provider)
    }

    pub fn credentials(&self) -> Result<ClientCredentials> {
        self.validate()?;
        Ok(ClientCredentials {
            client_id: self.client_id.clone().unwrap_or_default(),
            client_secret: self.client_secret.clone().unwrap_or_default(),
            redirect_uri: self.redirect_uri.clone(),
        })
    }

    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        let mut settings = ManagerSettings::new(self.credentials()?);
        settings.refresh_buffer = Duration::from_secs(self.refresh_buffer_secs);
        settings.operation_timeout = self.operation_timeout_secs.map(Duration::from_secs);
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Directory holding encrypted token files
    pub fn token_dir(&self) -> Result<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("tokens")),
        }
    }

    /// Bytes the token cipher keys are derived from
    pub fn key_material(&self) -> Result<Vec<u8>> {
        self.encryption_key
            .as_deref()
            .or(self.client_secret.as_deref())
            .filter(|k| !k.is_empty())
            .map(|k| k.as_bytes().to_vec())
            .context("No encryption key: set encryption_key or client_secret")
    }
}
