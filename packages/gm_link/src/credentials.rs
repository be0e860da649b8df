//! Persistent credential storage.
//!
//! The store is an opaque string key-value map. Only the renewal coordinator
//! (on renewal) and the session flows (login, join, leave, logout) write to
//! it; consumers never touch it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;

/// Well-known store keys.
pub mod keys {
    /// Access credential attached to every request and the stream URL.
    pub const ACCESS_TOKEN: &str = "access_token";
    /// Renewal credential for the active access credential.
    pub const REFRESH_TOKEN: &str = "refresh_token";
    /// Account pair stashed while a game-session pair is active.
    pub const USER_ACCESS_TOKEN: &str = "user_access_token";
    pub const USER_REFRESH_TOKEN: &str = "user_refresh_token";
    /// Session pair kept so the session can be rejoined.
    pub const SESSION_ACCESS_TOKEN: &str = "session_access_token";
    pub const SESSION_REFRESH_TOKEN: &str = "session_refresh_token";
    pub const IS_GM: &str = "is_gm";
    pub const PLAYER_ID: &str = "player_id";
    pub const SESSION_CODE: &str = "session_code";
    pub const USER: &str = "user";

    pub const ALL: &[&str] = &[
        ACCESS_TOKEN,
        REFRESH_TOKEN,
        USER_ACCESS_TOKEN,
        USER_REFRESH_TOKEN,
        SESSION_ACCESS_TOKEN,
        SESSION_REFRESH_TOKEN,
        IS_GM,
        PLAYER_ID,
        SESSION_CODE,
        USER,
    ];
}

/// Opaque persistent key-value store.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Write several keys as one mutation. Implementations that persist
    /// should make the whole batch visible at once.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Remove several keys as one mutation.
    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Write `sets` and remove `removes` as one mutation.
    fn apply(&self, sets: &[(&str, &str)], removes: &[&str]) -> Result<(), StoreError> {
        self.set_many(sets)?;
        self.remove_many(removes)
    }
}

/// Where a credential pair lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSlot {
    /// The pair currently used for requests and the stream.
    Active,
    /// The account pair, stashed while a session pair is active.
    Account,
    /// The session pair, kept for rejoin.
    Session,
}

impl CredentialSlot {
    fn keys(self) -> (&'static str, &'static str) {
        match self {
            Self::Active => (keys::ACCESS_TOKEN, keys::REFRESH_TOKEN),
            Self::Account => (keys::USER_ACCESS_TOKEN, keys::USER_REFRESH_TOKEN),
            Self::Session => (keys::SESSION_ACCESS_TOKEN, keys::SESSION_REFRESH_TOKEN),
        }
    }
}

/// Access credential plus the renewal credential that can replace it.
///
/// Older deployments hand out session tokens without a renewal credential,
/// so `renewal` is optional.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub renewal: Option<String>,
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &redact(&self.access))
            .field("renewal", &self.renewal.as_deref().map(redact))
            .finish()
    }
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, renewal: Option<String>) -> Self {
        Self {
            access: access.into(),
            renewal,
        }
    }

    /// Read the pair stored in `slot`. `None` when no access credential is stored.
    pub fn load(store: &dyn CredentialStore, slot: CredentialSlot) -> Option<Self> {
        let (access_key, renewal_key) = slot.keys();
        let access = store.get(access_key)?;
        Some(Self {
            access,
            renewal: store.get(renewal_key),
        })
    }

    /// Replace both halves of the pair in `slot` in a single store mutation.
    /// A pair without a renewal credential removes the stored one.
    pub fn save(&self, store: &dyn CredentialStore, slot: CredentialSlot) -> Result<(), StoreError> {
        let (access_key, renewal_key) = slot.keys();
        match &self.renewal {
            Some(renewal) => store.apply(
                &[
                    (access_key, self.access.as_str()),
                    (renewal_key, renewal.as_str()),
                ],
                &[],
            ),
            None => store.apply(&[(access_key, self.access.as_str())], &[renewal_key]),
        }
    }

    pub fn clear(store: &dyn CredentialStore, slot: CredentialSlot) -> Result<(), StoreError> {
        let (access_key, renewal_key) = slot.keys();
        store.remove_many(&[access_key, renewal_key])
    }
}

/// Remove every credential and identifier this crate writes.
pub fn clear_all(store: &dyn CredentialStore) -> Result<(), StoreError> {
    store.remove_many(keys::ALL)
}

/// Shorten a credential for logs.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}…")
}

// =============================================================================
// In-memory store
// =============================================================================

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn apply(&self, sets: &[(&str, &str)], removes: &[&str]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in sets {
            entries.insert(key.to_string(), value.to_string());
        }
        for key in removes {
            entries.remove(*key);
        }
        Ok(())
    }
}

// =============================================================================
// File-backed store
// =============================================================================

const STORE_FILE: &str = "credentials.json";

/// JSON file store, rewritten in full on every mutation.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    /// Open `<data_dir>/credentials.json`, starting empty if it does not exist.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(STORE_FILE);
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), keys = entries.len(), "loaded credential store");
            entries
        } else {
            info!(path = %path.display(), "starting empty credential store");
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut entries);
        self.persist(&entries)
    }

    /// Write the map to disk with mode 0600.
    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(entries)?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&self.path, raw).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn set_many(&self, batch: &[(&str, &str)]) -> Result<(), StoreError> {
        self.mutate(|entries| {
            for (key, value) in batch {
                entries.insert(key.to_string(), value.to_string());
            }
        })
    }

    fn remove_many(&self, batch: &[&str]) -> Result<(), StoreError> {
        self.mutate(|entries| {
            for key in batch {
                entries.remove(*key);
            }
        })
    }

    fn apply(&self, sets: &[(&str, &str)], removes: &[&str]) -> Result<(), StoreError> {
        self.mutate(|entries| {
            for (key, value) in sets {
                entries.insert(key.to_string(), value.to_string());
            }
            for key in removes {
                entries.remove(*key);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_roundtrip_in_slots() {
        let store = MemoryCredentialStore::new();
        let pair = CredentialPair::new("acc-1", Some("ren-1".into()));
        pair.save(&store, CredentialSlot::Session).unwrap();

        assert_eq!(store.get(keys::SESSION_ACCESS_TOKEN).as_deref(), Some("acc-1"));
        assert_eq!(store.get(keys::SESSION_REFRESH_TOKEN).as_deref(), Some("ren-1"));
        assert!(CredentialPair::load(&store, CredentialSlot::Active).is_none());
        assert_eq!(
            CredentialPair::load(&store, CredentialSlot::Session),
            Some(pair)
        );
    }

    #[test]
    fn test_save_without_renewal_drops_stale_renewal() {
        let store = MemoryCredentialStore::new();
        CredentialPair::new("old", Some("old-ren".into()))
            .save(&store, CredentialSlot::Active)
            .unwrap();
        CredentialPair::new("legacy", None)
            .save(&store, CredentialSlot::Active)
            .unwrap();

        let loaded = CredentialPair::load(&store, CredentialSlot::Active).unwrap();
        assert_eq!(loaded.access, "legacy");
        assert!(loaded.renewal.is_none());
    }

    /// Counts every store mutation the caller issues.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCredentialStore,
        mutations: std::sync::atomic::AtomicUsize,
    }

    impl CountingStore {
        fn bump(&self) {
            self.mutations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn take(&self) -> usize {
            self.mutations.swap(0, std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl CredentialStore for CountingStore {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.bump();
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.bump();
            self.inner.remove(key)
        }

        fn apply(&self, sets: &[(&str, &str)], removes: &[&str]) -> Result<(), StoreError> {
            self.bump();
            self.inner.apply(sets, removes)
        }
    }

    #[test]
    fn test_save_is_one_mutation_with_and_without_renewal() {
        let store = CountingStore::default();
        CredentialPair::new("acc-1", Some("ren-1".into()))
            .save(&store, CredentialSlot::Account)
            .unwrap();
        assert_eq!(store.take(), 1);

        CredentialPair::new("acc-2", None)
            .save(&store, CredentialSlot::Account)
            .unwrap();
        assert_eq!(store.take(), 1);
        assert_eq!(store.get(keys::USER_ACCESS_TOKEN).as_deref(), Some("acc-2"));
        assert!(store.get(keys::USER_REFRESH_TOKEN).is_none());
    }

    #[test]
    fn test_file_store_apply_writes_sets_and_removes_together() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::open(tmp.path()).unwrap();
            CredentialPair::new("acc", Some("ren".into()))
                .save(&store, CredentialSlot::Session)
                .unwrap();
            CredentialPair::new("legacy", None)
                .save(&store, CredentialSlot::Session)
                .unwrap();
        }

        let raw = std::fs::read_to_string(tmp.path().join("credentials.json")).unwrap();
        let on_disk: BTreeMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            on_disk.get(keys::SESSION_ACCESS_TOKEN).map(String::as_str),
            Some("legacy")
        );
        assert!(!on_disk.contains_key(keys::SESSION_REFRESH_TOKEN));
    }

    #[test]
    fn test_clear_all_removes_identifiers() {
        let store = MemoryCredentialStore::new();
        store.set(keys::ACCESS_TOKEN, "a").unwrap();
        store.set(keys::PLAYER_ID, "7").unwrap();
        store.set(keys::SESSION_CODE, "ABC123").unwrap();
        store.set("unrelated", "kept").unwrap();

        clear_all(&store).unwrap();

        assert!(store.get(keys::ACCESS_TOKEN).is_none());
        assert!(store.get(keys::PLAYER_ID).is_none());
        assert!(store.get(keys::SESSION_CODE).is_none());
        assert_eq!(store.get("unrelated").as_deref(), Some("kept"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = CredentialPair::new("supersecretaccess", Some("supersecretrenewal".into()));
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains("supersecretaccess"));
        assert!(!rendered.contains("supersecretrenewal"));
        assert!(rendered.contains("supers"));
    }

    #[test]
    fn test_file_store_persists_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::open(tmp.path()).unwrap();
            CredentialPair::new("acc", Some("ren".into()))
                .save(&store, CredentialSlot::Active)
                .unwrap();
            store.set(keys::IS_GM, "true").unwrap();
        }

        let reopened = FileCredentialStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.get(keys::ACCESS_TOKEN).as_deref(), Some("acc"));
        assert_eq!(reopened.get(keys::REFRESH_TOKEN).as_deref(), Some("ren"));
        assert_eq!(reopened.get(keys::IS_GM).as_deref(), Some("true"));
        assert_eq!(reopened.path(), tmp.path().join("credentials.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_mode_0600() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(tmp.path()).unwrap();
        store.set(keys::ACCESS_TOKEN, "acc").unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("credentials.json"), "not json").unwrap();
        let err = FileCredentialStore::open(tmp.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
