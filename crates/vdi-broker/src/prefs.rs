//! Preference persistence.
//!
//! The controller never owns a settings UI or format — it reads and
//! writes a small set of named keys through [`PrefStore`]. A JSON-file
//! implementation is provided for the CLI front end, plus helpers for
//! the most-recently-used broker list the front end maintains after
//! each successful connect.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{BrokerError, BrokerResult};

/// Abstract key-value settings store.
pub trait PrefStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  JSON file store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flat JSON-object file store. Every `set`/`remove` rewrites the file;
/// write failures are logged, never fatal.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> BrokerResult<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                BrokerError::parse(format!("Malformed preference file {}: {e}", path.display()))
            })?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, values: Mutex::new(values) })
    }

    fn flush(&self, values: &BTreeMap<String, String>) {
        match serde_json::to_string_pretty(values) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    log::warn!("Failed to write preferences {}: {e}", self.path.display());
                }
            }
            Err(e) => log::warn!("Failed to encode preferences: {e}"),
        }
    }
}

impl PrefStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.lock().unwrap();
        if values.remove(key).is_some() {
            self.flush(&values);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  MRU broker list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MRU_LIMIT: usize = 10;

/// Read the recent-broker list, most recent first (`broker0..brokerN`).
pub fn recent_brokers(store: &dyn PrefStore) -> Vec<String> {
    let mut brokers = Vec::new();
    for i in 0..MRU_LIMIT {
        match store.get(&format!("broker{i}")) {
            Some(addr) if !addr.is_empty() => brokers.push(addr),
            _ => break,
        }
    }
    brokers
}

/// Promote `address` to the front of the recent-broker list.
///
/// Deduplicates, caps the list at ten entries, and rewrites the
/// `broker0..brokerN` keys.
pub fn remember_broker(store: &dyn PrefStore, address: &str) {
    if address.is_empty() {
        return;
    }
    let mut brokers = recent_brokers(store);
    brokers.retain(|b| b != address);
    brokers.insert(0, address.to_string());
    brokers.truncate(MRU_LIMIT);

    for (i, addr) in brokers.iter().enumerate() {
        store.set(&format!("broker{i}"), addr);
    }
    for i in brokers.len()..MRU_LIMIT {
        store.remove(&format!("broker{i}"));
    }
}

/// Persisted name of the last selected desktop.
pub const PREF_LAST_DESKTOP: &str = "lastDesktop";

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("prefs.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set(PREF_LAST_DESKTOP, "Dev Desktop");

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(PREF_LAST_DESKTOP).as_deref(), Some("Dev Desktop"));

        reopened.remove(PREF_LAST_DESKTOP);
        let again = JsonFileStore::open(&path).unwrap();
        assert_eq!(again.get(PREF_LAST_DESKTOP), None);
    }

    #[test]
    fn mru_promotes_and_dedupes() {
        let (_dir, store) = temp_store();

        remember_broker(&store, "a.example");
        remember_broker(&store, "b.example");
        remember_broker(&store, "c.example");
        assert_eq!(recent_brokers(&store), vec!["c.example", "b.example", "a.example"]);

        // Revisiting an old broker moves it to the front, once.
        remember_broker(&store, "a.example");
        assert_eq!(recent_brokers(&store), vec!["a.example", "c.example", "b.example"]);
    }

    #[test]
    fn mru_is_capped() {
        let (_dir, store) = temp_store();
        for i in 0..15 {
            remember_broker(&store, &format!("broker-{i}.example"));
        }
        let brokers = recent_brokers(&store);
        assert_eq!(brokers.len(), 10);
        assert_eq!(brokers[0], "broker-14.example");
        assert_eq!(brokers[9], "broker-5.example");
    }
}
