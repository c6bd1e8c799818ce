//! Command handlers for the CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use token_keeper::auth::{
    FileTokenStore, OAuthTokenEndpoint, RefreshScheduler, TokenCipher, TokenError, TokenManager,
};
use token_keeper::Config;

fn endpoint(config: &Config) -> Result<OAuthTokenEndpoint> {
    Ok(OAuthTokenEndpoint::new(
        &config.provider()?,
        config.request_timeout(),
        config.retry_policy(),
    )?)
}

fn open_manager(config: &Config, account: &str) -> Result<TokenManager> {
    let settings = config.manager_settings()?;
    let cipher = TokenCipher::new(&config.key_material()?)?;
    let store = FileTokenStore::new(config.token_dir()?, cipher);
    tracing::debug!("Token directory: {}", store.dir().display());

    Ok(TokenManager::open(
        account,
        settings,
        Arc::new(endpoint(config)?),
        Arc::new(store),
    )?)
}

/// Attach the way out to errors that need a fresh consent.
fn explain(err: TokenError) -> anyhow::Error {
    if err.requires_reauth() {
        anyhow::Error::new(err).context(
            "Re-authentication required: run `token-keeper auth-url`, then `token-keeper login --code <CODE>`",
        )
    } else {
        err.into()
    }
}

pub fn auth_url(config: &Config) -> Result<()> {
    let credentials = config.credentials()?;
    let (url, state) = endpoint(config)?.authorization_url(&credentials)?;

    println!();
    println!("To authorize, visit: {}", url);
    println!("Expected state:      {}", state.secret());
    println!();
    println!("Then run: token-keeper login --code <CODE>");
    Ok(())
}

pub async fn login(config: &Config, account: &str, code: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    let record = manager.authenticate(code).await.map_err(explain)?;
    println!(
        "Login successful. Access token expires at {}.",
        record.expires_at
    );
    Ok(())
}

pub async fn token(config: &Config, account: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    println!("{}", manager.get_access_token().await.map_err(explain)?);
    Ok(())
}

pub async fn headers(config: &Config, account: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    let headers = manager.get_headers().await.map_err(explain)?;
    for (name, value) in headers.iter() {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    Ok(())
}

pub async fn refresh(config: &Config, account: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    let record = manager.refresh().await.map_err(explain)?;
    println!(
        "Token refreshed (refresh #{}). Expires at {}.",
        record.refresh_count, record.expires_at
    );
    Ok(())
}

pub async fn seed(config: &Config, account: &str, refresh_token: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    manager.set_refresh_token(refresh_token).await?;
    println!("Refresh token stored for account '{}'.", account);
    Ok(())
}

pub async fn status(config: &Config, account: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    let info = manager.get_token_info().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("Failed to serialize token info")?
    );
    Ok(())
}

pub async fn logout(config: &Config, account: &str) -> Result<()> {
    let manager = open_manager(config, account)?;
    manager.clear().await?;
    println!("Logged out.");
    Ok(())
}

pub async fn watch(config: &Config, account: &str, interval: u64) -> Result<()> {
    let manager = Arc::new(open_manager(config, account)?);
    let handle = RefreshScheduler::new(manager)
        .idle_interval(Duration::from_secs(interval.max(1)))
        .spawn();

    println!("Keeping tokens for '{}' fresh. Press Ctrl-C to stop.", account);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    handle.stop().await;
    Ok(())
}
