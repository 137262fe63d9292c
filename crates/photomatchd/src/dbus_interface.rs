use crate::engine::EngineHandle;
use crate::pipeline::Pipeline;
use crate::search::{SearchRequest, SearchService};
use crate::watcher::Watcher;
use chrono::{DateTime, Utc};
use photomatch_core::FeatureRecord;
use photomatch_hw::Printer;
use photomatch_store::SettingsStore;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the photomatch kiosk daemon.
///
/// Bus name: org.photomatch.Kiosk1
/// Object path: /org/photomatch/Kiosk1
pub struct KioskService {
    pub pipeline: Arc<Pipeline>,
    pub settings: Arc<SettingsStore>,
    pub search: Arc<SearchService>,
    pub watcher: Arc<Watcher>,
    pub engine: EngineHandle,
    pub printer: Printer,
    /// Station used when a caller passes an empty one.
    pub station: String,
    pub capture_dir: PathBuf,
    pub jpeg_quality: u8,
}

/// Gallery entry without embeddings.
#[derive(Serialize)]
struct RecordSummary {
    id: String,
    filename: String,
    timestamp: DateTime<Utc>,
    output_path: PathBuf,
    annotated_path: Option<PathBuf>,
    face_count: usize,
    person_count: usize,
    colors: Vec<String>,
}

impl From<&FeatureRecord> for RecordSummary {
    fn from(r: &FeatureRecord) -> Self {
        Self {
            id: r.id.clone(),
            filename: r.filename.clone(),
            timestamp: r.timestamp,
            output_path: r.output_path.clone(),
            annotated_path: r.annotated_path.clone(),
            face_count: r.faces.len(),
            person_count: r.persons.len(),
            colors: r.swatches().map(|s| s.hex()).collect(),
        }
    }
}

fn failed(e: impl Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Run blocking work (inference, disk, spooler) off the async executor.
async fn blocking<T, F>(work: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> zbus::fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(failed)?
}

impl KioskService {
    fn station_or_default(&self, station: &str) -> String {
        if station.is_empty() {
            self.station.clone()
        } else {
            station.to_string()
        }
    }

    fn parse_request(request: &str) -> zbus::fdo::Result<SearchRequest> {
        if request.trim().is_empty() {
            return Ok(SearchRequest::default());
        }
        serde_json::from_str(request).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
    }
}

#[interface(name = "org.photomatch.Kiosk1")]
impl KioskService {
    /// Process one photo and return its stored record.
    async fn process_image(&self, path: &str, station: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, station, "process_image requested");
        let pipeline = Arc::clone(&self.pipeline);
        let station = self.station_or_default(station);
        let path = PathBuf::from(path);
        let record = blocking(move || pipeline.process(&path, &station).map_err(failed)).await?;
        to_json(&RecordSummary::from(&record))
    }

    /// Process every intake file without a record yet.
    async fn process_pending(&self, station: &str) -> zbus::fdo::Result<String> {
        tracing::info!(station, "process_pending requested");
        let pipeline = Arc::clone(&self.pipeline);
        let station = self.station_or_default(station);
        let outcome = blocking(move || Ok(pipeline.process_all_pending(&station))).await?;
        to_json(&outcome)
    }

    /// Search by face image and/or colors. `request` is a JSON object with
    /// `face_image`, `colors`, `face_weight`, `color_weight`, `max_results`, `station`.
    async fn search(&self, request: &str) -> zbus::fdo::Result<String> {
        let request = Self::parse_request(request)?;
        let (pipeline, settings, search) =
            (Arc::clone(&self.pipeline), Arc::clone(&self.settings), Arc::clone(&self.search));
        let station = self.station.clone();
        let response = blocking(move || {
            search
                .search(&pipeline, settings.as_ref(), &station, &request)
                .map_err(failed)
        })
        .await?;
        to_json(&response)
    }

    /// Capture a still and search with the face found in it.
    async fn search_camera(&self, request: &str) -> zbus::fdo::Result<String> {
        let request = Self::parse_request(request)?;
        let frame = self.engine.capture().await.map_err(failed)?;
        let (pipeline, settings, search) =
            (Arc::clone(&self.pipeline), Arc::clone(&self.settings), Arc::clone(&self.search));
        let station = self.station.clone();
        let response = blocking(move || {
            search
                .search_image(&pipeline, settings.as_ref(), &station, &request, &frame.image)
                .map_err(failed)
        })
        .await?;
        to_json(&response)
    }

    /// Newest records first.
    async fn list(&self, limit: u32, offset: u32) -> zbus::fdo::Result<String> {
        let records = self.pipeline.store().list(limit as usize, offset as usize);
        let summaries: Vec<RecordSummary> = records.iter().map(RecordSummary::from).collect();
        to_json(&serde_json::json!({
            "total": self.pipeline.store().count(),
            "records": summaries,
        }))
    }

    /// Full record, embeddings included.
    async fn get(&self, id: &str) -> zbus::fdo::Result<String> {
        match self.pipeline.store().get(id) {
            Some(record) => to_json(&record),
            None => Err(zbus::fdo::Error::InvalidArgs(format!("no record with id {id}"))),
        }
    }

    async fn delete(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "delete requested");
        let pipeline = Arc::clone(&self.pipeline);
        let id = id.to_string();
        blocking(move || pipeline.store().delete(&id).map_err(failed)).await
    }

    async fn delete_all(&self) -> zbus::fdo::Result<u32> {
        tracing::warn!("delete_all requested");
        let pipeline = Arc::clone(&self.pipeline);
        let removed = blocking(move || pipeline.store().delete_all().map_err(failed)).await?;
        Ok(removed as u32)
    }

    async fn watcher_start(&self) -> zbus::fdo::Result<bool> {
        match self.watcher.start() {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "watcher start refused");
                Ok(false)
            }
        }
    }

    async fn watcher_stop(&self) -> zbus::fdo::Result<bool> {
        let watcher = Arc::clone(&self.watcher);
        blocking(move || Ok(watcher.stop())).await
    }

    /// Remove leftover scratch files.
    async fn cleanup_scratch(&self) -> zbus::fdo::Result<u32> {
        let pipeline = Arc::clone(&self.pipeline);
        let deleted = blocking(move || Ok(pipeline.cleanup_scratch())).await?;
        Ok(deleted as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let search = self.search.config_for(self.settings.as_ref(), &self.station);
        let records = self.pipeline.store().snapshot();
        let stats = photomatch_core::Matcher::new(search.clone()).stats(records.iter());
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "station": self.station,
            "camera": self.engine.device(),
            "watcher": {
                "running": self.watcher.is_running(),
                "queue": self.watcher.queue_len(),
            },
            "pipeline": self.pipeline.stats(),
            "records": stats,
            "search": search,
        }))
    }

    /// Capture a still to the captures folder and return its path.
    async fn capture(&self) -> zbus::fdo::Result<String> {
        let frame = self.engine.capture().await.map_err(failed)?;
        let dir = self.capture_dir.clone();
        let quality = self.jpeg_quality;
        blocking(move || {
            std::fs::create_dir_all(&dir).map_err(failed)?;
            let path = dir.join(format!("capture_{}.jpg", Utc::now().format("%Y%m%d_%H%M%S_%3f")));
            let jpeg = frame.to_jpeg(quality).map_err(failed)?;
            std::fs::write(&path, jpeg).map_err(failed)?;
            tracing::info!(path = %path.display(), "capture saved");
            Ok(path.display().to_string())
        })
        .await
    }

    /// Close the camera so another application can use it.
    async fn release_camera(&self) -> zbus::fdo::Result<bool> {
        self.engine.release().await.map_err(failed)
    }

    /// Send a file to the spooler. An empty `printer` uses the default queue.
    async fn print(&self, path: &str, printer: &str, copies: u32) -> zbus::fdo::Result<bool> {
        tracing::info!(path, printer, copies, "print requested");
        let spooler = self.printer.clone();
        let path = PathBuf::from(path);
        let target = (!printer.is_empty()).then(|| printer.to_string());
        blocking(move || match spooler.print(&path, target.as_deref(), copies) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!(error = %e, "print failed");
                Ok(false)
            }
        })
        .await
    }

    /// All settings of one station, keyed by category.
    async fn get_settings(&self, station: &str) -> zbus::fdo::Result<String> {
        let station = self.station_or_default(station);
        to_json(&self.settings.station(&station))
    }

    /// Store a JSON settings blob (`crop`, `clothing`, `search`) for a station.
    async fn save_settings(&self, station: &str, category: &str, value: &str) -> zbus::fdo::Result<()> {
        let value: serde_json::Value =
            serde_json::from_str(value).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let station = self.station_or_default(station);
        self.settings.save(&station, category, value).map_err(failed)
    }

    async fn delete_settings(&self, station: &str, category: &str) -> zbus::fdo::Result<bool> {
        let station = self.station_or_default(station);
        self.settings.delete(&station, category).map_err(failed)
    }
}
