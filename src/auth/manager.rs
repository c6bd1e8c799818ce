//! Per-account token manager.
//!
//! One [`TokenManager`] owns one account's credential. Every read and write
//! of the in-memory record goes through a single async mutex, and network
//! exchanges happen while it is held, so at most one refresh is in flight
//! per account. A caller that queued behind a refresh sees the refreshed
//! record and returns it without a second exchange.
//!
//! Expiry is evaluated lazily on access; [`super::scheduler`] can refresh
//! ahead of time but is never required for correctness.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::Mutex;

use super::clock::{Clock, SystemClock};
use super::endpoint::{EndpointError, TokenEndpoint};
use super::error::{TokenError, TokenResult};
use super::store::{self, TokenStore};
use super::tokens::{TokenInfo, TokenRecord, TokenStatus};
use super::ClientCredentials;

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);
pub const MAX_REFRESH_BUFFER: Duration = Duration::from_secs(24 * 3600);

const CLIENT_ID_HEADER: &str = "amazon-advertising-api-clientid";

/// Construction-time configuration for one account.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub credentials: ClientCredentials,
    /// How long before expiry a token counts as due for refresh.
    pub refresh_buffer: Duration,
    /// Upper bound on authenticate/refresh/get calls, including lock waits
    /// and retries.
    pub operation_timeout: Option<Duration>,
}

impl ManagerSettings {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            credentials,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            operation_timeout: None,
        }
    }
}

pub struct TokenManager {
    account: String,
    settings: ManagerSettings,
    buffer: chrono::Duration,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<TokenRecord>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("account", &self.account)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create the manager and load any persisted record. The provider is
    /// not contacted.
    pub fn open(
        account: impl Into<String>,
        settings: ManagerSettings,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
    ) -> TokenResult<Self> {
        Self::open_with_clock(account, settings, endpoint, store, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        account: impl Into<String>,
        settings: ManagerSettings,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> TokenResult<Self> {
        let account = account.into();
        store::validate_account(&account)?;
        if settings.refresh_buffer > MAX_REFRESH_BUFFER {
            return Err(TokenError::InvalidInput(format!(
                "refresh buffer {:?} exceeds {:?}",
                settings.refresh_buffer, MAX_REFRESH_BUFFER
            )));
        }
        let buffer = chrono::Duration::from_std(settings.refresh_buffer).map_err(|_| {
            TokenError::InvalidInput(format!(
                "refresh buffer {:?} out of range",
                settings.refresh_buffer
            ))
        })?;

        // Unreadable records fail closed: start unauthenticated.
        let initial = match store.load(&account) {
            Ok(record) => record,
            Err(TokenError::Corruption { account, reason }) => {
                tracing::error!(
                    "Discarding unreadable token record for {}: {}",
                    account,
                    reason
                );
                None
            }
            Err(e) => return Err(e),
        };
        if initial.is_some() {
            tracing::debug!("Loaded persisted token record for {}", account);
        }

        Ok(Self {
            account,
            settings,
            buffer,
            endpoint,
            store,
            clock,
            state: Mutex::new(initial),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Exchange an authorization code for a token pair and persist it.
    ///
    /// Codes are single-use, so a rejection is final. If the record cannot
    /// be persisted the error is returned but the new tokens stay usable
    /// in memory.
    pub async fn authenticate(&self, code: &str) -> TokenResult<TokenRecord> {
        let code = code.trim();
        if code.is_empty() {
            return Err(TokenError::InvalidInput(
                "authorization code is empty".into(),
            ));
        }
        deadline(self.settings.operation_timeout, self.authenticate_locked(code)).await
    }

    async fn authenticate_locked(&self, code: &str) -> TokenResult<TokenRecord> {
        let mut state = self.state.lock().await;

        let response = self
            .endpoint
            .exchange_code(code, &self.settings.credentials)
            .await
            .map_err(|err| match err {
                EndpointError::Rejected { .. } if err.is_revoked_grant() => {
                    TokenError::Authentication {
                        reason: err.to_string(),
                    }
                }
                EndpointError::Rejected { .. } => TokenError::Rejected {
                    reason: err.to_string(),
                },
                EndpointError::Transient { attempts, reason } => {
                    TokenError::Exchange { attempts, reason }
                }
                EndpointError::Protocol(reason) => TokenError::Exchange {
                    attempts: 1,
                    reason,
                },
                EndpointError::Config(reason) => TokenError::InvalidInput(reason),
            })?;

        let record = TokenRecord::from_exchange(response, self.clock.now())?;
        *state = Some(record.clone());
        tracing::info!("Authenticated account {}", self.account);

        self.persist(&record).await?;
        Ok(record)
    }

    /// A valid access token, refreshing first if it is inside the buffer
    /// window.
    pub async fn get_access_token(&self) -> TokenResult<String> {
        deadline(self.settings.operation_timeout, self.access_token_locked()).await
    }

    /// Like [`Self::get_access_token`] with an explicit deadline. On
    /// timeout the stored state is left as it was.
    pub async fn get_access_token_within(&self, timeout: Duration) -> TokenResult<String> {
        deadline(Some(timeout), self.access_token_locked()).await
    }

    async fn access_token_locked(&self) -> TokenResult<String> {
        let mut state = self.state.lock().await;
        let current = state.as_ref().ok_or_else(|| self.not_authenticated())?;
        if current.status(self.clock.now(), self.buffer) == TokenStatus::Valid {
            return Ok(current.access_token.clone());
        }

        tracing::info!("Access token for {} is due for refresh", self.account);
        match self.refresh_locked(&mut state).await {
            Ok(record) => Ok(record.access_token),
            Err(TokenError::Storage(reason)) => {
                // The refreshed record is in memory; only persistence failed.
                tracing::error!(
                    "Refreshed token for {} could not be persisted: {}",
                    self.account,
                    reason
                );
                state
                    .as_ref()
                    .map(|record| record.access_token.clone())
                    .ok_or_else(|| self.not_authenticated())
            }
            Err(err @ TokenError::Refresh { .. }) => match state.as_ref() {
                Some(record)
                    if !record.access_token.is_empty()
                        && !record.is_expired(self.clock.now()) =>
                {
                    tracing::warn!(
                        "{}; serving current token for {} until {}",
                        err,
                        self.account,
                        record.expires_at
                    );
                    Ok(record.access_token.clone())
                }
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Authorization headers for an Advertising API request.
    pub async fn get_headers(&self) -> TokenResult<HeaderMap> {
        let token = self.get_access_token().await?;

        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            TokenError::InvalidInput("access token is not a valid header value".into())
        })?;
        bearer.set_sensitive(true);
        let client_id = HeaderValue::from_str(&self.settings.credentials.client_id)
            .map_err(|_| TokenError::InvalidInput("client id is not a valid header value".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(HeaderName::from_static(CLIENT_ID_HEADER), client_id);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Refresh now, regardless of remaining lifetime.
    ///
    /// Transient failures keep the old record. A revoked refresh token
    /// (`invalid_grant`) clears the account and returns
    /// [`TokenError::Authentication`]; any other rejection keeps it and
    /// returns [`TokenError::Rejected`].
    #[doc(alias = "refresh_access_token")]
    pub async fn refresh(&self) -> TokenResult<TokenRecord> {
        deadline(self.settings.operation_timeout, async {
            let mut state = self.state.lock().await;
            self.refresh_locked(&mut state).await
        })
        .await
    }

    /// Caller must hold the state lock.
    async fn refresh_locked(&self, state: &mut Option<TokenRecord>) -> TokenResult<TokenRecord> {
        let current = state.clone().ok_or_else(|| self.not_authenticated())?;

        match self
            .endpoint
            .exchange_refresh(&current.refresh_token, &self.settings.credentials)
            .await
        {
            Ok(response) => {
                let record = current.refreshed(response, self.clock.now());
                *state = Some(record.clone());
                tracing::info!(
                    "Refreshed access token for {} (refresh #{}, expires {})",
                    self.account,
                    record.refresh_count,
                    record.expires_at
                );
                self.persist(&record).await?;
                Ok(record)
            }
            Err(err) if err.is_revoked_grant() => {
                tracing::warn!(
                    "Refresh token for {} rejected ({}); re-authentication required",
                    self.account,
                    err
                );
                *state = None;
                if let Err(e) = self
                    .with_store(|store, account| store.delete(account))
                    .await
                {
                    tracing::error!(
                        "Failed to delete revoked token record for {}: {}",
                        self.account,
                        e
                    );
                }
                Err(TokenError::Authentication {
                    reason: err.to_string(),
                })
            }
            Err(err @ EndpointError::Rejected { .. }) => {
                tracing::error!(
                    "Token refresh for {} refused ({}); check client credentials, stored tokens kept",
                    self.account,
                    err
                );
                Err(TokenError::Rejected {
                    reason: err.to_string(),
                })
            }
            Err(EndpointError::Transient { attempts, reason }) => {
                tracing::warn!("Token refresh for {} failed: {}", self.account, reason);
                Err(TokenError::Refresh { attempts, reason })
            }
            Err(EndpointError::Protocol(reason)) => {
                tracing::warn!("Token refresh for {} failed: {}", self.account, reason);
                Err(TokenError::Refresh {
                    attempts: 1,
                    reason,
                })
            }
            Err(EndpointError::Config(reason)) => Err(TokenError::InvalidInput(reason)),
        }
    }

    /// Seed the account from an externally obtained refresh token. The next
    /// access refreshes immediately.
    pub async fn set_refresh_token(&self, refresh_token: &str) -> TokenResult<()> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(TokenError::InvalidInput("refresh token is empty".into()));
        }

        let mut state = self.state.lock().await;
        let record = TokenRecord::from_refresh_token(refresh_token.to_string(), self.clock.now());
        *state = Some(record.clone());
        tracing::info!("Seeded refresh token for {}", self.account);
        self.persist(&record).await
    }

    /// Snapshot of the current state. Never refreshes or touches storage.
    pub async fn get_token_info(&self) -> TokenInfo {
        let state = self.state.lock().await;
        TokenInfo::snapshot(&self.account, state.as_ref(), self.clock.now(), self.buffer)
    }

    /// Time until the record enters the refresh window, `None` when
    /// unauthenticated.
    pub async fn refresh_due_in(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|record| record.until_refresh_due(self.clock.now(), self.buffer))
    }

    /// Forget the in-memory record and delete the persisted one. Idempotent.
    #[doc(alias = "clear_tokens")]
    pub async fn clear(&self) -> TokenResult<()> {
        let mut state = self.state.lock().await;
        *state = None;
        self.with_store(|store, account| store.delete(account)).await?;
        tracing::info!("Cleared tokens for {}", self.account);
        Ok(())
    }

    async fn persist(&self, record: &TokenRecord) -> TokenResult<()> {
        let record = record.clone();
        self.with_store(move |store, account| store.save(account, &record)).await
    }

    /// Run a blocking store call on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> TokenResult<T>
    where
        F: FnOnce(&dyn TokenStore, &str) -> TokenResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref(), &account))
            .await
            .map_err(|e| TokenError::Storage(format!("store task failed: {}", e)))?
    }

    fn not_authenticated(&self) -> TokenError {
        TokenError::NotAuthenticated {
            account: self.account.clone(),
        }
    }
}

/// Bound `fut` by `limit`. Dropping the future on timeout releases the
/// state lock before any partial record is written.
async fn deadline<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = TokenResult<T>>,
) -> TokenResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TokenError::Timeout(limit))?,
        None => fut.await,
    }
}
