use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tracing::warn;

use crate::types::ScheduleKind;
use crate::{Error, Result};

/// Durable key/value state shared with the rest of the control plane.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Non-empty string value. Numbers are rendered as strings.
    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => Some(s == "true" || s == "1"),
            Value::Number(n) => Some(n.as_f64() == Some(1.0)),
            _ => None,
        }
    }
}

pub mod keys {
    use super::ScheduleKind;

    pub const ACCESS_TOKEN: &str = "Auth.accessToken";
    pub const ACCESS_TOKEN_EXPIRES_AT: &str = "Auth.accessTokenExpiresAt";
    pub const REFRESH_TOKEN: &str = "Auth.refreshToken";
    pub const CLIENT_ID: &str = "Auth.clientId";
    pub const CLIENT_SECRET: &str = "Auth.clientSecret";
    pub const TOKEN_ENDPOINT: &str = "Auth._tokenEndpoint";
    pub const REDIRECT_URI: &str = "Auth.redirectUri";
    pub const SCOPE: &str = "Auth.scope";
    pub const AUTHORIZE_URL: &str = "Auth.loginHelper.authorizeUrl";
    pub const AUTHORIZATION_CODE: &str = "Auth.loginHelper.authorizationCode";
    pub const CODE_VERIFIER: &str = "Auth.loginHelper._codeVerifier";

    pub const INSTALLATION_ID: &str = "Config.installationId";
    pub const AUTO_REFRESH: &str = "Config.autoRefresh";
    pub const DEVICE_PROBE_LIST: &str = "Config.deviceProbeList";

    pub const GATEWAY_ID: &str = "IDs.gatewayId";
    pub const DEVICE_ID: &str = "IDs.deviceId";

    pub const STATS_BURNER_HOURS_TOTAL: &str = "Stats.burnerHoursTotal";
    pub const STATS_BURNER_HOURS_TODAY: &str = "Stats.burnerHoursToday";
    pub const STATS_BASE_HOURS: &str = "Stats._midnightBaseHours";
    pub const STATS_BASE_DATE: &str = "Stats._midnightBaseDate";

    pub const LAST_TRIED: &str = "Raw.lastTried";
    pub const LAST_STATUS: &str = "Raw.lastStatus";
    pub const LAST_ERROR: &str = "Raw.error";
    pub const TOKEN_INFO: &str = "Raw.tokenInfo";
    pub const FEATURES_JSON: &str = "Raw.featuresJson";
    pub const GATEWAY_FEATURES_JSON: &str = "Raw.gatewayFeaturesJson";
    pub const DISCOVERY_TRIED: &str = "Raw.discovery.triedPathsJson";
    pub const DISCOVERY_FOUND: &str = "Raw.discovery.foundDeviceIds";
    pub const DISCOVERY_LAST_PICK: &str = "Raw.discovery.lastPick";

    pub fn schedule(kind: ScheduleKind, leaf: &str) -> String {
        format!("Ctrl.{}.{leaf}", kind.state_key())
    }

    pub fn entries(kind: ScheduleKind) -> String {
        schedule(kind, "entries")
    }

    pub fn active(kind: ScheduleKind) -> String {
        schedule(kind, "active")
    }

    pub fn schedule_json(kind: ScheduleKind) -> String {
        schedule(kind, "scheduleJson")
    }

    pub fn boost_minutes(kind: ScheduleKind) -> String {
        schedule(kind, "boostMinutes")
    }

    pub fn backup(kind: ScheduleKind) -> String {
        schedule(kind, "_backup")
    }

    pub fn restore_at(kind: ScheduleKind) -> String {
        schedule(kind, "_restoreAt")
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        lock(&self.values).clone()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON document on disk, rewritten through a temp file whenever a `set`
/// changes a value. Steady-state polls mostly rewrite identical values and
/// skip the disk entirely.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => match serde_json::from_str(&text)? {
                Value::Object(map) => map,
                _ => {
                    warn!(path = %path.display(), "state file is not an object, starting empty");
                    Map::new()
                }
            },
            Ok(_) => Map::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = lock(&self.values);
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        values.insert(key.to_string(), value);
        self.persist(&values)
    }
}

/// Writes a timestamped diagnostic to the "last error" key.
pub fn record_error(store: &dyn StateStore, now: DateTime<Local>, context: &str, err: &Error) {
    let message = format!("{} {context} failed [{}]: {err}", now.to_rfc3339(), err.category());
    if let Err(e) = store.set(keys::LAST_ERROR, Value::String(message)) {
        warn!("failed to record error: {e}");
    }
}

fn lock(m: &Mutex<Map<String, Value>>) -> std::sync::MutexGuard<'_, Map<String, Value>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn typed_getters() {
        let store = MemoryStore::new();
        store.set("a", json!("")).unwrap();
        store.set("b", json!(12.5)).unwrap();
        store.set("c", json!("true")).unwrap();
        assert_eq!(store.get_str("a"), None);
        assert_eq!(store.get_str("b").as_deref(), Some("12.5"));
        assert_eq!(store.get_f64("b"), Some(12.5));
        assert_eq!(store.get_bool("c"), Some(true));
        assert_eq!(store.get_bool("missing"), None);
    }

    #[test]
    fn schedule_keys() {
        assert_eq!(keys::entries(ScheduleKind::Circulation), "Ctrl.circSchedule.entries");
        assert_eq!(keys::restore_at(ScheduleKind::HotWater), "Ctrl.dhwSchedule._restoreAt");
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set(keys::DEVICE_ID, json!("0")).unwrap();
            store.set(keys::ACCESS_TOKEN_EXPIRES_AT, json!(1234)).unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_str(keys::DEVICE_ID).as_deref(), Some("0"));
        assert_eq!(store.get_f64(keys::ACCESS_TOKEN_EXPIRES_AT), Some(1234.0));
    }

    #[test]
    fn file_store_skips_unchanged_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).unwrap();
        store.set(keys::DEVICE_ID, json!("0")).unwrap();
        fs::remove_file(&path).unwrap();

        store.set(keys::DEVICE_ID, json!("0")).unwrap();
        assert!(!path.exists());
        store.set(keys::DEVICE_ID, json!("1")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.get(keys::ACCESS_TOKEN).is_none());
    }
}
