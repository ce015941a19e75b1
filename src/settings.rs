//! ==============================================================================
//! settings.rs - durable key/value settings store
//! ==============================================================================
//!
//! purpose:
//!     holds the node's persistent configuration: wifi credentials, whether
//!     the access point should close, and the switch (led) state.
//!
//! keys:
//!     the key set is closed. `SettingKey` enumerates it, every key has a
//!     declared value kind, and anything else is rejected with `UnknownKey`.
//!
//!         wifi_ssid     string   default ""
//!         wifi_pass     string   default ""
//!         close_ap      bool     default false
//!         switch_state  bool     default false
//!
//! durability:
//!     `set` returns Ok only after the backend has flushed the value to the
//!     medium. if the flush fails the in-memory value is rolled back and the
//!     previous value is rewritten, since a failure after the rename (the
//!     directory sync) leaves the new value already on disk.
//!
//! relationships:
//!     - used by: main.rs (boot-time load, switch state)
//!     - backends: `FileBackend` (one fsync'd file per key)
//!
//! ==============================================================================

use std::fmt;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::SettingsError;

// ==============================================================================
// keys and values
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    WifiSsid,
    WifiPass,
    CloseAp,
    SwitchState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Flag,
}

impl ValueKind {
    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Text => "string",
            ValueKind::Flag => "bool",
        }
    }
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::WifiSsid,
        SettingKey::WifiPass,
        SettingKey::CloseAp,
        SettingKey::SwitchState,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            SettingKey::WifiSsid => "wifi_ssid",
            SettingKey::WifiPass => "wifi_pass",
            SettingKey::CloseAp => "close_ap",
            SettingKey::SwitchState => "switch_state",
        }
    }

    pub const fn kind(self) -> ValueKind {
        match self {
            SettingKey::WifiSsid | SettingKey::WifiPass => ValueKind::Text,
            SettingKey::CloseAp | SettingKey::SwitchState => ValueKind::Flag,
        }
    }

    pub fn default_value(self) -> SettingValue {
        match self.kind() {
            ValueKind::Text => SettingValue::Text(String::new()),
            ValueKind::Flag => SettingValue::Flag(false),
        }
    }

    const fn index(self) -> usize {
        match self {
            SettingKey::WifiSsid => 0,
            SettingKey::WifiPass => 1,
            SettingKey::CloseAp => 2,
            SettingKey::SwitchState => 3,
        }
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.name() == name)
            .ok_or_else(|| SettingsError::UnknownKey(name.to_string()))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored value. Serialized as a bare JSON scalar (`"home"` or `true`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Text(String),
}

impl SettingValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            SettingValue::Flag(_) => ValueKind::Flag,
            SettingValue::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(text) => Some(text),
            SettingValue::Flag(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SettingValue::Flag(flag) => Some(*flag),
            SettingValue::Text(_) => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(flag: bool) -> Self {
        SettingValue::Flag(flag)
    }
}

impl From<&str> for SettingValue {
    fn from(text: &str) -> Self {
        SettingValue::Text(text.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(text: String) -> Self {
        SettingValue::Text(text)
    }
}

/// The full set of settings, one slot per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    values: [SettingValue; 4],
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            values: SettingKey::ALL.map(SettingKey::default_value),
        }
    }
}

impl SettingsRecord {
    pub fn get(&self, key: SettingKey) -> &SettingValue {
        &self.values[key.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingKey, &SettingValue)> {
        SettingKey::ALL.into_iter().map(move |key| (key, self.get(key)))
    }

    fn put(&mut self, key: SettingKey, value: SettingValue) -> SettingValue {
        std::mem::replace(&mut self.values[key.index()], value)
    }
}

// ==============================================================================
// backend contract
// ==============================================================================

/// Persistence medium behind a [`SettingsStore`].
///
/// Implementations must make `write` durable before returning `Ok`: a value
/// acknowledged here has to survive an immediate power loss.
pub trait SettingsBackend: Send {
    /// Every stored entry. Keys never written are simply absent.
    fn read_all(&mut self) -> Result<Vec<(SettingKey, SettingValue)>, SettingsError>;

    /// Durably store a single key.
    fn write(&mut self, key: SettingKey, value: &SettingValue) -> Result<(), SettingsError>;

    /// Erase every stored entry.
    fn clear(&mut self) -> Result<(), SettingsError>;
}

// ==============================================================================
// store
// ==============================================================================

/// Result of a [`SettingsStore::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub record: SettingsRecord,
    /// `Some(StorageCorrupt)` when storage had to be reset to defaults.
    pub recovered: Option<SettingsError>,
}

pub struct SettingsStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    record: SettingsRecord,
    backend: Box<dyn SettingsBackend>,
}

impl SettingsStore {
    /// Open a store over `backend` and perform the startup load.
    pub fn open(
        backend: impl SettingsBackend + 'static,
    ) -> Result<(Self, LoadOutcome), SettingsError> {
        let store = Self {
            inner: Mutex::new(StoreInner {
                record: SettingsRecord::default(),
                backend: Box::new(backend),
            }),
        };
        let outcome = store.load()?;
        Ok((store, outcome))
    }

    /// Re-read durable storage, substituting defaults for missing keys.
    ///
    /// Corrupt storage is not fatal: the backend is cleared, the record is
    /// reset to defaults and the condition is reported in
    /// [`LoadOutcome::recovered`]. Only a backend that cannot be read at all
    /// is returned as an error.
    pub fn load(&self) -> Result<LoadOutcome, SettingsError> {
        let mut inner = self.lock();

        let stored = inner.backend.read_all().and_then(|entries| {
            for (key, value) in &entries {
                if value.kind() != key.kind() {
                    return Err(SettingsError::StorageCorrupt(format!(
                        "{key} holds a {} value, expected {}",
                        value.kind().name(),
                        key.kind().name()
                    )));
                }
            }
            Ok(entries)
        });

        match stored {
            Ok(entries) => {
                let mut record = SettingsRecord::default();
                let defaulted = SettingKey::ALL.len().saturating_sub(entries.len());
                for (key, value) in entries {
                    record.put(key, value);
                }
                info!("settings loaded ({defaulted} key(s) at default)");
                inner.record = record.clone();
                Ok(LoadOutcome {
                    record,
                    recovered: None,
                })
            }
            Err(SettingsError::StorageCorrupt(reason)) => {
                warn!("settings storage corrupt ({reason}), resetting to defaults");
                // defaults are served even if the medium cannot be wiped; the
                // next successful `set` overwrites the bad entry
                if let Err(e) = inner.backend.clear() {
                    error!("could not reset settings storage: {e}");
                }
                inner.record = SettingsRecord::default();
                Ok(LoadOutcome {
                    record: inner.record.clone(),
                    recovered: Some(SettingsError::StorageCorrupt(reason)),
                })
            }
            Err(other) => Err(other),
        }
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        self.lock().record.get(key).clone()
    }

    pub fn get_by_name(&self, name: &str) -> Result<SettingValue, SettingsError> {
        Ok(self.get(name.parse()?))
    }

    /// Validate, apply and durably flush a single key.
    pub fn set(&self, key: SettingKey, value: impl Into<SettingValue>) -> Result<(), SettingsError> {
        let value = value.into();
        if value.kind() != key.kind() {
            return Err(SettingsError::InvalidValueType {
                key: key.name(),
                expected: key.kind().name(),
            });
        }

        let mut guard = self.lock();
        let StoreInner { record, backend } = &mut *guard;

        let previous = record.put(key, value.clone());
        if let Err(err) = backend.write(key, &value) {
            // the failed write may still have landed (e.g. rename done, dir
            // sync failed); put the committed value back on the medium too
            if let Err(restore) = backend.write(key, &previous) {
                error!("could not restore {key} on storage: {restore}");
            }
            record.put(key, previous);
            let err = match err {
                SettingsError::PersistFailure(_) => err,
                other => SettingsError::PersistFailure(other.to_string()),
            };
            error!("failed to persist {key}, value rolled back: {err}");
            return Err(err);
        }

        debug!("setting {key} committed");
        Ok(())
    }

    pub fn set_by_name(
        &self,
        name: &str,
        value: impl Into<SettingValue>,
    ) -> Result<(), SettingsError> {
        self.set(name.parse()?, value)
    }

    /// Copy of the committed record.
    pub fn record(&self) -> SettingsRecord {
        self.lock().record.clone()
    }

    pub fn wifi_ssid(&self) -> String {
        self.text(SettingKey::WifiSsid)
    }

    pub fn wifi_pass(&self) -> String {
        self.text(SettingKey::WifiPass)
    }

    pub fn close_ap(&self) -> bool {
        self.flag(SettingKey::CloseAp)
    }

    pub fn switch_state(&self) -> bool {
        self.flag(SettingKey::SwitchState)
    }

    pub fn set_switch_state(&self, on: bool) -> Result<(), SettingsError> {
        self.set(SettingKey::SwitchState, on)
    }

    // the record only ever holds values of the key's declared kind, so the
    // fallbacks below are unreachable in practice
    fn text(&self, key: SettingKey) -> String {
        self.lock()
            .record
            .get(key)
            .as_text()
            .unwrap_or_default()
            .to_string()
    }

    fn flag(&self, key: SettingKey) -> bool {
        self.lock().record.get(key).as_flag().unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ==============================================================================
// file backend
// ==============================================================================

/// One file per key under a directory: `<dir>/<key>.json`.
///
/// Writes go to `<key>.json.tmp`, are fsync'd, renamed over the target, and
/// the directory is fsync'd so the rename itself is durable. A crash at any
/// point leaves either the old or the new value on disk, never a mix.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| persist_error("create", &dir, &e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: SettingKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.name()))
    }

    fn tmp_path_for(&self, key: SettingKey) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", key.name()))
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> io::Result<()> {
        Ok(())
    }
}

impl SettingsBackend for FileBackend {
    fn read_all(&mut self) -> Result<Vec<(SettingKey, SettingValue)>, SettingsError> {
        let mut entries = Vec::with_capacity(SettingKey::ALL.len());
        for key in SettingKey::ALL {
            // a leftover tmp file is an interrupted write; the target still
            // holds the last committed value
            let tmp = self.tmp_path_for(key);
            match fs::remove_file(&tmp) {
                Ok(()) => debug!("removed interrupted write {}", tmp.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {e}", tmp.display()),
            }

            // an unreadable entry says nothing about its contents: that key
            // falls back to its default and every other key is kept
            let path = self.path_for(key);
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("cannot read {}: {e}; using default for {key}", path.display());
                    continue;
                }
            };
            let value = serde_json::from_slice::<SettingValue>(&raw).map_err(|e| {
                SettingsError::StorageCorrupt(format!("{}: {e}", path.display()))
            })?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn write(&mut self, key: SettingKey, value: &SettingValue) -> Result<(), SettingsError> {
        let path = self.path_for(key);
        let tmp = self.tmp_path_for(key);
        let payload = serde_json::to_vec(value)
            .map_err(|e| SettingsError::PersistFailure(format!("encode {key}: {e}")))?;

        {
            let mut file = File::create(&tmp).map_err(|e| persist_error("create", &tmp, &e))?;
            file.write_all(&payload)
                .map_err(|e| persist_error("write", &tmp, &e))?;
            file.sync_all().map_err(|e| persist_error("sync", &tmp, &e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| persist_error("rename", &path, &e))?;
        self.sync_dir()
            .map_err(|e| persist_error("sync", &self.dir, &e))?;
        Ok(())
    }

    /// Removes every entry it can; the first failure is reported after the
    /// remaining entries have been tried.
    fn clear(&mut self) -> Result<(), SettingsError> {
        let mut first_err = None;
        for key in SettingKey::ALL {
            for path in [self.path_for(key), self.tmp_path_for(key)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        first_err.get_or_insert_with(|| persist_error("remove", &path, &e));
                    }
                }
            }
        }
        self.sync_dir()
            .map_err(|e| persist_error("sync", &self.dir, &e))?;
        first_err.map_or(Ok(()), Err)
    }
}

fn persist_error(op: &str, path: &Path, err: &io::Error) -> SettingsError {
    SettingsError::PersistFailure(format!("{op} {}: {err}", path.display()))
}

// ==============================================================================
// tests
// ==============================================================================
