//! Durable local record of the current credential bundle.
//!
//! The bundle is persisted as plain string scalars under fixed keys in a [`Storage`] backend.
//! Writes go through [`Storage::apply`], which commits a whole set of keys at once, and reads go
//! through [`Storage::get_many`], which sees exactly one commit, so a reader can never observe
//! half of an old bundle and half of a new one.
//!
//! Older clients stored only a bare access token under [`LEGACY_TOKEN_KEY`] next to the session
//! id.  [`TokenStore::load`] upgrades such a record in place the first time it sees it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use utf8path::Path;

use crate::clock::Clock;
use crate::observability::{TOKEN_STORE_CLEARS, TOKEN_STORE_MIGRATIONS, TOKEN_STORE_REJECTS};
use crate::utils::time as timestamp;
use crate::{CredentialBundle, Error, Result};

/// Storage key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage key of the backend session id.  Shared with the legacy layout.
pub const SESSION_ID_KEY: &str = "session_id";
/// Storage key of the access token expiry (RFC 3339).
pub const EXPIRES_AT_KEY: &str = "expires_at";
/// Storage key of the refresh token expiry (RFC 3339).
pub const REFRESH_EXPIRES_AT_KEY: &str = "refresh_expires_at";
/// Storage key of the bare access token written by older clients.
pub const LEGACY_TOKEN_KEY: &str = "token";

const ALL_KEYS: [&str; 6] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    SESSION_ID_KEY,
    EXPIRES_AT_KEY,
    REFRESH_EXPIRES_AT_KEY,
    LEGACY_TOKEN_KEY,
];

/// Lifetime given to an upgraded legacy token when nothing better is known.
pub const DEFAULT_LEGACY_LIFETIME: Duration = Duration::from_secs(15 * 60);

///////////////////////////////////////////// Storage //////////////////////////////////////////////

/// Client-local key/value storage of string scalars.
pub trait Storage: Send + Sync {
    /// Returns the values stored under `keys`, in order, as of a single commit.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>>;

    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_many(&[key])?.pop().flatten())
    }

    /// Writes every entry in `set` and deletes every key in `remove` as one atomic commit.
    fn apply(&self, set: &[(&str, String)], remove: &[&str]) -> Result<()>;

    /// Writes every entry in `entries` atomically.
    fn set_many(&self, entries: &[(&str, String)]) -> Result<()> {
        self.apply(entries, &[])
    }

    /// Deletes every key in `keys` atomically.
    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        self.apply(&[], keys)
    }
}

/// In-process storage.  Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage pre-populated with `entries`.
    pub fn with_entries<K: Into<String>, V: Into<String>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Returns a copy of everything currently stored.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Storage for MemoryStorage {
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys.iter().map(|key| entries.get(*key).cloned()).collect())
    }

    fn apply(&self, set: &[(&str, String)], remove: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in remove {
            entries.remove(*key);
        }
        for (key, value) in set {
            entries.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }
}

/// Storage backed by a single JSON object on disk.
///
/// Every commit rewrites the file through a temporary sibling and a rename, so the file on disk
/// always holds one complete commit.
#[derive(Debug)]
pub struct FileStorage {
    path: Path<'static>,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Creates storage at `path`.  The file is created on first write.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: Path::from(path.as_ref()).into_owned(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the backing file's path.
    pub fn path(&self) -> &str {
        self.path.as_str()
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(self.path.as_str()) {
            Ok(data) if data.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                Error::storage(
                    format!("credential file {} is corrupt: {e}", self.path.as_str()),
                    Some(Box::new(e)),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::storage(
                format!("could not read {}: {e}", self.path.as_str()),
                Some(Box::new(e)),
            )),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let target = std::path::Path::new(self.path.as_str());
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let staging = format!("{}.tmp", self.path.as_str());
        let data = serde_json::to_string_pretty(map)?;
        std::fs::write(&staging, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&staging, target)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        Ok(keys.iter().map(|key| map.remove(*key)).collect())
    }

    fn apply(&self, set: &[(&str, String)], remove: &[&str]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        for key in remove {
            map.remove(*key);
        }
        for (key, value) in set {
            map.insert((*key).to_string(), value.clone());
        }
        self.write_map(&map)
    }
}

//////////////////////////////////////////// TokenStore ////////////////////////////////////////////

/// The current credential bundle, persisted in client-local storage.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    legacy_lifetime: Duration,
}

impl TokenStore {
    /// Creates a token store over `storage`.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            legacy_lifetime: DEFAULT_LEGACY_LIFETIME,
        }
    }

    /// Sets the lifetime assigned to upgraded legacy tokens.
    pub fn with_legacy_lifetime(mut self, lifetime: Duration) -> Self {
        self.legacy_lifetime = lifetime;
        self
    }

    /// Returns the clock used for expiry decisions.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Replaces the current bundle.
    pub fn save(&self, bundle: &CredentialBundle) -> Result<()> {
        let entries = [
            (ACCESS_TOKEN_KEY, bundle.access_token.clone()),
            (REFRESH_TOKEN_KEY, bundle.refresh_token.clone()),
            (SESSION_ID_KEY, bundle.session_id.clone()),
            (EXPIRES_AT_KEY, timestamp::format(bundle.expires_at)?),
            (
                REFRESH_EXPIRES_AT_KEY,
                timestamp::format(bundle.refresh_expires_at)?,
            ),
        ];
        self.storage.apply(&entries, &[LEGACY_TOKEN_KEY])
    }

    /// Returns the current bundle, if there is a usable one.
    ///
    /// A bundle whose refresh token has expired is cleared and not returned.  A legacy record is
    /// upgraded and written back before it is returned.
    pub fn load(&self) -> Result<Option<CredentialBundle>> {
        let mut record = self.read_record()?;
        let bundle = match self.read_current(&mut record)? {
            Some(bundle) => bundle,
            None => match self.read_legacy(&mut record) {
                Some(bundle) => {
                    self.save(&bundle)?;
                    TOKEN_STORE_MIGRATIONS.click();
                    tracing::info!(
                        session_id = %bundle.session_id,
                        "upgraded legacy credential record"
                    );
                    bundle
                }
                None => return Ok(None),
            },
        };
        if bundle.is_refresh_expired(self.clock.now()) {
            TOKEN_STORE_REJECTS.click();
            tracing::info!(
                session_id = %bundle.session_id,
                "stored credentials are past their refresh expiry; clearing"
            );
            self.clear()?;
            return Ok(None);
        }
        Ok(Some(bundle))
    }

    /// Removes every trace of the current bundle, legacy fields included.
    pub fn clear(&self) -> Result<()> {
        TOKEN_STORE_CLEARS.click();
        self.storage.remove_many(&ALL_KEYS)
    }

    fn read_record(&self) -> Result<BTreeMap<&'static str, String>> {
        let values = self.storage.get_many(&ALL_KEYS)?;
        Ok(ALL_KEYS
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }

    fn read_current(
        &self,
        record: &mut BTreeMap<&'static str, String>,
    ) -> Result<Option<CredentialBundle>> {
        let Some(access_token) = record.remove(ACCESS_TOKEN_KEY) else {
            return Ok(None);
        };
        let session_id = record.remove(SESSION_ID_KEY);
        let expires_at = record.remove(EXPIRES_AT_KEY);
        let (Some(session_id), Some(expires_at)) = (session_id, expires_at) else {
            tracing::warn!("credential record is missing required fields; clearing");
            return self.discard(record);
        };
        let expires_at = match timestamp::parse(&expires_at) {
            Ok(when) => when,
            Err(err) => {
                tracing::warn!(error = %err, "credential record has an unreadable expiry; clearing");
                return self.discard(record);
            }
        };
        let refresh_expires_at = match record.remove(REFRESH_EXPIRES_AT_KEY) {
            Some(text) => match timestamp::parse(&text) {
                Ok(when) => when,
                Err(err) => {
                    tracing::warn!(error = %err, "credential record has an unreadable refresh expiry; clearing");
                    return self.discard(record);
                }
            },
            None => expires_at,
        };
        let refresh_token = record.remove(REFRESH_TOKEN_KEY).unwrap_or_default();
        Ok(Some(CredentialBundle {
            access_token,
            refresh_token,
            session_id,
            expires_at,
            refresh_expires_at,
        }))
    }

    fn discard(
        &self,
        record: &mut BTreeMap<&'static str, String>,
    ) -> Result<Option<CredentialBundle>> {
        record.clear();
        self.clear()?;
        Ok(None)
    }

    fn read_legacy(&self, record: &mut BTreeMap<&'static str, String>) -> Option<CredentialBundle> {
        let token = record.remove(LEGACY_TOKEN_KEY).filter(|token| !token.is_empty())?;
        let session_id = record.remove(SESSION_ID_KEY).unwrap_or_default();
        let expires_at = self.clock.now() + self.legacy_lifetime;
        Some(CredentialBundle {
            access_token: token,
            refresh_token: String::new(),
            session_id,
            expires_at,
            refresh_expires_at: expires_at,
        })
    }
}
