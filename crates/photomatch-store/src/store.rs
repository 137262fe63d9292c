use crate::{read_json, write_json_atomic, StoreError};
use photomatch_core::FeatureRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Durable map of feature records keyed by id.
pub trait FeatureStore: Send + Sync {
    /// Persist a new record and return its id.
    fn add(&self, record: FeatureRecord) -> Result<String, StoreError>;
    fn get(&self, id: &str) -> Option<FeatureRecord>;
    fn get_by_filename(&self, filename: &str) -> Option<FeatureRecord>;
    /// Page of records, newest capture first.
    fn list(&self, limit: usize, offset: usize) -> Vec<FeatureRecord>;
    /// Every record in insertion order, as of the call.
    fn snapshot(&self) -> Arc<Vec<FeatureRecord>>;
    /// `Ok(false)` when no record has this id.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
    /// Remove everything; returns how many records were dropped.
    fn delete_all(&self) -> Result<usize, StoreError>;
    fn count(&self) -> usize;
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    images: Vec<FeatureRecord>,
}

/// JSON-file feature store.
///
/// Writers serialize on one mutex around read-modify-persist; readers take
/// the current `Arc` snapshot and never wait on disk I/O.
pub struct JsonFeatureStore {
    path: PathBuf,
    write: Mutex<()>,
    records: RwLock<Arc<Vec<FeatureRecord>>>,
}

impl JsonFeatureStore {
    /// Open (or start) the store at `path`. A corrupt file is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file: StoreFile = read_json(&path)?.unwrap_or_default();
        tracing::info!(path = %path.display(), records = file.images.len(), "feature store opened");
        Ok(Self {
            path,
            write: Mutex::new(()),
            records: RwLock::new(Arc::new(file.images)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current(&self) -> Arc<Vec<FeatureRecord>> {
        let guard = self.records.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Apply `change` to a copy of the records, persist, then publish.
    /// Memory is untouched if persisting fails.
    fn mutate<R>(&self, change: impl FnOnce(&mut Vec<FeatureRecord>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let _writer = self.write.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = (*self.current()).clone();
        let out = change(&mut next)?;

        let file = StoreFile { images: next };
        write_json_atomic(&self.path, &file)?;

        let mut guard = self.records.write().map_err(|_| StoreError::Poisoned)?;
        *guard = Arc::new(file.images);
        Ok(out)
    }
}

impl FeatureStore for JsonFeatureStore {
    fn add(&self, record: FeatureRecord) -> Result<String, StoreError> {
        let id = record.id.clone();
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(StoreError::Duplicate(record.id.clone()));
            }
            records.push(record);
            Ok(())
        })?;
        tracing::debug!(%id, "record added");
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<FeatureRecord> {
        self.current().iter().find(|r| r.id == id).cloned()
    }

    fn get_by_filename(&self, filename: &str) -> Option<FeatureRecord> {
        self.current().iter().find(|r| r.filename == filename).cloned()
    }

    fn list(&self, limit: usize, offset: usize) -> Vec<FeatureRecord> {
        let snapshot = self.current();
        let mut ordered: Vec<&FeatureRecord> = snapshot.iter().collect();
        ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        ordered.into_iter().skip(offset).take(limit).cloned().collect()
    }

    fn snapshot(&self) -> Arc<Vec<FeatureRecord>> {
        self.current()
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        if !self.current().iter().any(|r| r.id == id) {
            return Ok(false);
        }
        let removed = self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        })?;
        tracing::debug!(id, removed, "record delete");
        Ok(removed)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let removed = self.mutate(|records| {
            let n = records.len();
            records.clear();
            Ok(n)
        })?;
        tracing::info!(removed, "feature store cleared");
        Ok(removed)
    }

    fn count(&self) -> usize {
        self.current().len()
    }
}
