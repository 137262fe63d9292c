use crate::{read_json, write_json_atomic, StoreError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Read-only view of per-(station, category) settings blobs.
pub trait SettingsSource: Send + Sync {
    fn get(&self, station: &str, category: &str) -> Option<Value>;
}

/// Source with nothing configured; every lookup falls back to defaults.
pub struct NoSettings;

impl SettingsSource for NoSettings {
    fn get(&self, _station: &str, _category: &str) -> Option<Value> {
        None
    }
}

type Categories = BTreeMap<String, Value>;

/// JSON-file settings, nested station → category → blob.
pub struct SettingsStore {
    path: PathBuf,
    stations: Mutex<BTreeMap<String, Categories>>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let stations: BTreeMap<String, Categories> = read_json(&path)?.unwrap_or_default();
        tracing::debug!(path = %path.display(), stations = stations.len(), "settings opened");
        Ok(Self { path, stations: Mutex::new(stations) })
    }

    /// Store a blob. Objects are stamped with `updated_at`.
    pub fn save(&self, station: &str, category: &str, value: Value) -> Result<(), StoreError> {
        let value = match value {
            Value::Object(mut map) => {
                map.insert("updated_at".into(), Value::String(chrono::Utc::now().to_rfc3339()));
                Value::Object(map)
            }
            other => other,
        };

        let mut stations = self.stations.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = stations.clone();
        next.entry(station.to_string()).or_default().insert(category.to_string(), value);
        write_json_atomic(&self.path, &next)?;
        *stations = next;
        tracing::info!(station, category, "settings saved");
        Ok(())
    }

    pub fn delete(&self, station: &str, category: &str) -> Result<bool, StoreError> {
        let mut stations = self.stations.lock().map_err(|_| StoreError::Poisoned)?;
        if !stations.get(station).is_some_and(|c| c.contains_key(category)) {
            return Ok(false);
        }
        let mut next = stations.clone();
        if let Some(categories) = next.get_mut(station) {
            categories.remove(category);
            if categories.is_empty() {
                next.remove(station);
            }
        }
        write_json_atomic(&self.path, &next)?;
        *stations = next;
        Ok(true)
    }

    /// All settings of one station, keyed by category.
    pub fn station(&self, station: &str) -> Map<String, Value> {
        let stations = self.stations.lock().unwrap_or_else(|e| e.into_inner());
        stations
            .get(station)
            .map(|categories| categories.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl SettingsSource for SettingsStore {
    fn get(&self, station: &str, category: &str) -> Option<Value> {
        let stations = self.stations.lock().unwrap_or_else(|e| e.into_inner());
        stations.get(station)?.get(category).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_get_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        store.save("kiosk1", "crop", json!({"enabled": true, "x": 10})).unwrap();

        let crop = store.get("kiosk1", "crop").unwrap();
        assert_eq!(crop["x"], 10);
        assert!(crop["updated_at"].is_string());
        assert!(store.get("kiosk2", "crop").is_none());

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get("kiosk1", "crop").unwrap()["x"], 10);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        store.save("default", "search", json!({"min_score": 30})).unwrap();
        assert!(store.delete("default", "search").unwrap());
        assert!(!store.delete("default", "search").unwrap());
        assert!(store.get("default", "search").is_none());
    }

    #[test]
    fn test_station_view() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        store.save("a", "crop", json!({})).unwrap();
        store.save("a", "search", json!({})).unwrap();
        store.save("b", "crop", json!({})).unwrap();
        let view = store.station("a");
        assert_eq!(view.len(), 2);
        assert!(view.contains_key("crop") && view.contains_key("search"));
    }

    #[test]
    fn test_no_settings() {
        assert!(NoSettings.get("any", "crop").is_none());
    }

    #[test]
    fn test_stations_sharing_a_prefix_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        store.save("booth", "crop", json!({"x": 1})).unwrap();
        store.save("booth_2", "crop", json!({"x": 2})).unwrap();
        store.save("a_b", "c", json!(1)).unwrap();
        store.save("a", "b_c", json!(2)).unwrap();

        let booth = store.station("booth");
        assert_eq!(booth.len(), 1);
        assert_eq!(booth["crop"]["x"], 1);
        assert_eq!(store.get("a_b", "c"), Some(json!(1)));
        assert_eq!(store.get("a", "b_c"), Some(json!(2)));

        assert!(store.delete("booth_2", "crop").unwrap());
        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get("booth", "crop").unwrap()["x"], 1);
        assert!(reopened.station("booth_2").is_empty());
    }
}
