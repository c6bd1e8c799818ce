//! Token record and status snapshots

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::endpoint::RawTokenResponse;
use super::error::{TokenError, TokenResult};

/// One account's credential state, the unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub refresh_count: u64,
    #[serde(default)]
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Build a record from a code-exchange response.
    pub fn from_exchange(response: RawTokenResponse, now: DateTime<Utc>) -> TokenResult<Self> {
        let refresh_token = response
            .refresh_token
            .filter(|rt| !rt.is_empty())
            .ok_or_else(|| TokenError::Authentication {
                reason: "provider did not issue a refresh token".into(),
            })?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token,
            token_type: response.token_type,
            issued_at: now,
            expires_at: expiry_from(now, response.expires_in),
            scope: response.scope.unwrap_or_default(),
            refresh_count: 0,
            last_refreshed_at: None,
        })
    }

    /// Placeholder record seeded from an externally obtained refresh token.
    ///
    /// The access token is empty and already expired, so the next access
    /// refreshes immediately.
    pub fn from_refresh_token(refresh_token: String, now: DateTime<Utc>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token,
            token_type: "bearer".into(),
            issued_at: now - Duration::seconds(2),
            expires_at: now - Duration::seconds(1),
            scope: String::new(),
            refresh_count: 0,
            last_refreshed_at: None,
        }
    }

    /// Apply a refresh response. The refresh token is kept unless the
    /// provider rotated it.
    pub fn refreshed(&self, response: RawTokenResponse, now: DateTime<Utc>) -> Self {
        let refresh_token = match response.refresh_token {
            Some(rt) if !rt.is_empty() => rt,
            _ => self.refresh_token.clone(),
        };
        let scope = match response.scope {
            Some(scope) => scope,
            None => self.scope.clone(),
        };

        Self {
            access_token: response.access_token,
            refresh_token,
            token_type: response.token_type,
            issued_at: now,
            expires_at: expiry_from(now, response.expires_in),
            scope,
            refresh_count: self.refresh_count + 1,
            last_refreshed_at: Some(now),
        }
    }

    pub fn status(&self, now: DateTime<Utc>, buffer: Duration) -> TokenStatus {
        match self.refresh_due_at(buffer) {
            Some(due) if now < due => TokenStatus::Valid,
            _ => TokenStatus::NeedsRefresh,
        }
    }

    /// Start of the refresh window; `None` if the buffer reaches past the
    /// representable range.
    fn refresh_due_at(&self, buffer: Duration) -> Option<DateTime<Utc>> {
        self.expires_at.checked_sub_signed(buffer)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until the refresh buffer is entered; zero when already inside.
    pub fn until_refresh_due(&self, now: DateTime<Utc>, buffer: Duration) -> std::time::Duration {
        self.refresh_due_at(buffer)
            .and_then(|due| (due - now).to_std().ok())
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Structural checks applied after decoding a persisted record.
    pub fn validate(&self) -> Result<(), String> {
        if self.expires_at <= self.issued_at {
            return Err("expires_at is not after issued_at".into());
        }
        if self.refresh_token.is_empty() {
            return Err("refresh token is empty".into());
        }
        Ok(())
    }
}

/// Longest token lifetime taken at face value from a provider.
pub const MAX_EXPIRES_IN: std::time::Duration = std::time::Duration::from_secs(366 * 24 * 3600);

fn expiry_from(now: DateTime<Utc>, expires_in: std::time::Duration) -> DateTime<Utc> {
    let secs = expires_in.as_secs().clamp(1, MAX_EXPIRES_IN.as_secs());
    let lifetime = Duration::seconds(i64::try_from(secs).unwrap_or(1));
    now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Logical state of an account's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Unauthenticated,
    Valid,
    NeedsRefresh,
}

/// Read-only snapshot for status displays. Never carries secrets.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub account: String,
    pub status: TokenStatus,
    pub expires_in_seconds: Option<i64>,
    pub is_expired: bool,
    pub refresh_count: u64,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    pub fn snapshot(
        account: &str,
        record: Option<&TokenRecord>,
        now: DateTime<Utc>,
        buffer: Duration,
    ) -> Self {
        match record {
            None => Self {
                account: account.to_string(),
                status: TokenStatus::Unauthenticated,
                expires_in_seconds: None,
                is_expired: true,
                refresh_count: 0,
                has_access_token: false,
                has_refresh_token: false,
                issued_at: None,
                expires_at: None,
                last_refreshed_at: None,
            },
            Some(record) => Self {
                account: account.to_string(),
                status: record.status(now, buffer),
                expires_in_seconds: Some((record.expires_at - now).num_seconds().max(0)),
                is_expired: record.is_expired(now),
                refresh_count: record.refresh_count,
                has_access_token: !record.access_token.is_empty(),
                has_refresh_token: !record.refresh_token.is_empty(),
                issued_at: Some(record.issued_at),
                expires_at: Some(record.expires_at),
                last_refreshed_at: record.last_refreshed_at,
            },
        }
    }
}
