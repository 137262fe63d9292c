//! photomatch-store: durable feature records and per-station settings.
//!
//! Both stores keep their state in one JSON document, rewritten whole on
//! every mutation through a temp file and rename.

pub mod settings;
pub mod store;

pub use settings::{NoSettings, SettingsSource, SettingsStore};
pub use store::{FeatureStore, JsonFeatureStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("store lock poisoned")]
    Poisoned,
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Read a JSON document, or `None` if the file is absent or blank.
/// A leading UTF-8 byte-order mark is skipped.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

/// Write `value` next to `path` and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_read_json_missing_and_blank() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Option<BTreeMap<String, u32>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());

        let blank = dir.path().join("blank.json");
        std::fs::write(&blank, "  \n").unwrap();
        let blank: Option<BTreeMap<String, u32>> = read_json(&blank).unwrap();
        assert!(blank.is_none());
    }

    #[test]
    fn test_read_json_skips_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bom.json");
        std::fs::write(&path, b"\xEF\xBB\xBF{\"a\": 1}").unwrap();
        let value: BTreeMap<String, u32> = read_json(&path).unwrap().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        write_json_atomic(&path, &BTreeMap::from([("k", 2)])).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested/doc.json.tmp").exists());
    }
}
