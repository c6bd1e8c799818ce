//! Durable token storage keyed by account identity.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::cipher::TokenCipher;
use super::error::{TokenError, TokenResult};
use super::tokens::TokenRecord;

const ENVELOPE_VERSION: u32 = 1;
const MAX_ACCOUNT_LEN: usize = 128;

/// Storage backend for token records.
///
/// `load` returns `Ok(None)` for a missing record; unreadable records are
/// reported as [`TokenError::Corruption`] so callers can fail closed.
pub trait TokenStore: Send + Sync {
    fn load(&self, account: &str) -> TokenResult<Option<TokenRecord>>;
    /// Replace the record atomically; a concurrent `load` sees the old or
    /// the new record, never a mix.
    fn save(&self, account: &str, record: &TokenRecord) -> TokenResult<()>;
    /// Remove the record. Missing records are not an error.
    fn delete(&self, account: &str) -> TokenResult<()>;
}

/// On-disk wrapper around the sealed record.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    encrypted: String,
}

/// One encrypted JSON file per account in a private directory.
#[derive(Debug)]
pub struct FileTokenStore {
    dir: PathBuf,
    cipher: TokenCipher,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>, cipher: TokenCipher) -> Self {
        Self {
            dir: dir.into(),
            cipher,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, account: &str) -> TokenResult<PathBuf> {
        validate_account(account)?;
        Ok(self.dir.join(format!("{}.json", account)))
    }

    fn ensure_dir(&self) -> TokenResult<()> {
        fs::create_dir_all(&self.dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    fn decode(&self, account: &str, raw: &[u8]) -> TokenResult<TokenRecord> {
        let corrupt = |reason: String| TokenError::Corruption {
            account: account.to_string(),
            reason,
        };

        let envelope: Envelope =
            serde_json::from_slice(raw).map_err(|e| corrupt(format!("envelope: {}", e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(corrupt(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(envelope.encrypted.as_bytes())
            .map_err(|e| corrupt(format!("base64: {}", e)))?;
        let plaintext = self
            .cipher
            .decrypt(&sealed)
            .map_err(|e| corrupt(e.to_string()))?;
        let record: TokenRecord =
            serde_json::from_slice(&plaintext).map_err(|e| corrupt(format!("record: {}", e)))?;
        record.validate().map_err(corrupt)?;
        Ok(record)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, account: &str) -> TokenResult<Option<TokenRecord>> {
        let path = self.record_path(account)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TokenError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        self.decode(account, &raw).map(Some)
    }

    fn save(&self, account: &str, record: &TokenRecord) -> TokenResult<()> {
        let path = self.record_path(account)?;
        self.ensure_dir()?;

        let plaintext = serde_json::to_vec(record)
            .map_err(|e| TokenError::Storage(format!("failed to serialize record: {}", e)))?;
        let sealed = self.cipher.encrypt(&plaintext)?;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            encrypted: base64::engine::general_purpose::STANDARD.encode(sealed),
        };
        let content = serde_json::to_vec(&envelope)
            .map_err(|e| TokenError::Storage(format!("failed to serialize envelope: {}", e)))?;

        // Unique temp name so concurrent writers never share a file.
        let tmp = self.dir.join(format!(".{}.{}.tmp", account, unique_suffix()?));
        let written = write_private(&tmp, &content).and_then(|_| fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(TokenError::Storage(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }

        tracing::debug!("Persisted token record for {}", account);
        Ok(())
    }

    fn delete(&self, account: &str) -> TokenResult<()> {
        let path = self.record_path(account)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Deleted token record for {}", account);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TokenError::Storage(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Create the file owner-only from the start, write and fsync.
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

fn unique_suffix() -> TokenResult<String> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf)
        .map_err(|e| TokenError::Storage(format!("OS CSPRNG failed: {}", e)))?;
    Ok(format!("{}-{:016x}", std::process::id(), u64::from_le_bytes(buf)))
}

/// Account identities double as file names.
pub fn validate_account(account: &str) -> TokenResult<()> {
    let valid = !account.is_empty()
        && account.len() <= MAX_ACCOUNT_LEN
        && !account.starts_with('.')
        && account
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(TokenError::InvalidInput(format!(
            "invalid account identity {:?}",
            account
        )))
    }
}

/// Process-local store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    records: Mutex<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> TokenResult<std::sync::MutexGuard<'_, HashMap<String, TokenRecord>>> {
        self.records
            .lock()
            .map_err(|_| TokenError::Storage("memory store lock poisoned".into()))
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, account: &str) -> TokenResult<Option<TokenRecord>> {
        Ok(self.records()?.get(account).cloned())
    }

    fn save(&self, account: &str, record: &TokenRecord) -> TokenResult<()> {
        self.records()?.insert(account.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, account: &str) -> TokenResult<()> {
        self.records()?.remove(account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn sample_record() -> TokenRecord {
        let issued = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        TokenRecord {
            access_token: "Atza|access".into(),
            refresh_token: "Atzr|refresh".into(),
            token_type: "bearer".into(),
            issued_at: issued,
            expires_at: issued + Duration::seconds(3600),
            scope: "advertising::campaign_management".into(),
            refresh_count: 4,
            last_refreshed_at: Some(issued),
        }
    }

    fn store_in(dir: &Path, key: &[u8]) -> FileTokenStore {
        FileTokenStore::new(dir.join("tokens"), TokenCipher::new(key).unwrap())
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        let record = sample_record();

        store.save("acct-1", &record).unwrap();
        assert_eq!(store.load("acct-1").unwrap(), Some(record));
    }

    #[test]
    fn test_file_does_not_contain_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        store.save("acct", &sample_record()).unwrap();

        let raw = fs::read_to_string(store.dir().join("acct.json")).unwrap();
        assert!(!raw.contains("Atzr|refresh"));
        assert!(!raw.contains("Atza|access"));
    }

    #[test]
    fn test_missing_record_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        assert_eq!(store.load("nobody").unwrap(), None);
    }

    #[test]
    fn test_wrong_key_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        store_in(tmp.path(), b"right")
            .save("acct", &sample_record())
            .unwrap();

        let err = store_in(tmp.path(), b"wrong").load("acct").unwrap_err();
        assert!(matches!(err, TokenError::Corruption { .. }));
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        store.save("acct", &sample_record()).unwrap();

        let path = store.dir().join("acct.json");
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() / 2]).unwrap();

        assert!(matches!(
            store.load("acct"),
            Err(TokenError::Corruption { .. })
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        store.save("acct", &sample_record()).unwrap();

        store.delete("acct").unwrap();
        store.delete("acct").unwrap();
        assert_eq!(store.load("acct").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        let mut record = sample_record();
        store.save("acct", &record).unwrap();

        record.access_token = "Atza|second".into();
        record.refresh_count += 1;
        store.save("acct", &record).unwrap();

        assert_eq!(store.load("acct").unwrap(), Some(record));
        let entries: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["acct.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path(), b"secret");
        store.save("acct", &sample_record()).unwrap();

        let file_mode = fs::metadata(store.dir().join("acct.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_concurrent_saves_never_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(tmp.path(), b"secret"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut record = sample_record();
                    record.refresh_count = i;
                    for _ in 0..10 {
                        store.save("shared", &record).unwrap();
                        assert!(store.load("shared").unwrap().is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(store.load("shared").unwrap().is_some());
    }

    #[test]
    fn test_account_validation() {
        assert!(validate_account("default").is_ok());
        assert!(validate_account("profile_123.eu-west").is_ok());
        assert!(validate_account("").is_err());
        assert!(validate_account("../etc/passwd").is_err());
        assert!(validate_account(".hidden").is_err());
        assert!(validate_account("a/b").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::new();
        store.save("acct", &sample_record()).unwrap();
        assert_eq!(store.load("acct").unwrap(), Some(sample_record()));
        store.delete("acct").unwrap();
        store.delete("acct").unwrap();
        assert_eq!(store.load("acct").unwrap(), None);
    }
}
