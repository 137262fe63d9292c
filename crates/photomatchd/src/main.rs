use anyhow::{Context, Result};
use photomatch_core::{Analyzer, Annotator, ModelPaths};
use photomatch_hw::Printer;
use photomatch_store::{JsonFeatureStore, SettingsStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod crop;
mod dbus_interface;
mod engine;
mod pipeline;
mod search;
mod watcher;

use config::Config;
use dbus_interface::KioskService;
use pipeline::{Pipeline, PipelineDirs};
use search::SearchService;
use watcher::{Watcher, WatcherOptions};

const BUS_NAME: &str = "org.photomatch.Kiosk1";
const OBJECT_PATH: &str = "/org/photomatch/Kiosk1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("photomatchd starting");

    let config = Config::from_env()?;
    tracing::info!(
        data = %config.data_dir.display(),
        models = %config.model_dir.display(),
        station = %config.station,
        "configuration loaded"
    );

    let models = ModelPaths::new(&config.model_dir);
    let analyzer = Analyzer::new(config.file.analysis.clone(), &models);
    let annotator = match &config.font_path {
        Some(path) => Annotator::with_font_file(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "font unavailable, annotations without labels");
            Annotator::new()
        }),
        None => Annotator::new(),
    };

    let store = Arc::new(JsonFeatureStore::open(config.store_path()).context("opening feature store")?);
    let settings = Arc::new(SettingsStore::open(config.settings_path()).context("opening settings store")?);

    let dirs = PipelineDirs {
        input: config.input_dir(),
        scratch: config.scratch_dir(),
        processed: config.processed_dir(),
        output: config.output_dir(),
    };
    let pipeline = Arc::new(Pipeline::new(
        dirs,
        config.file.processing.clone(),
        analyzer,
        annotator,
        store,
        settings.clone(),
    )?);
    pipeline.cleanup_scratch();

    let processing = &config.file.processing;
    let watcher = Arc::new(
        Watcher::new(
            Arc::clone(&pipeline),
            WatcherOptions {
                station: config.station.clone(),
                auto_process: processing.auto_process,
                settle_delay: Duration::from_millis(processing.settle_delay_ms),
                stop_timeout: Duration::from_millis(processing.stop_timeout_ms),
            },
        )
        .with_completion(|path, result| {
            if let Ok(record) = result {
                tracing::info!(path = %path.display(), id = %record.id, "new photo ready");
            }
        }),
    );
    if processing.watch_on_start {
        if let Err(e) = watcher.start() {
            tracing::warn!(error = %e, "watcher not started");
        }
    }

    let engine = engine::spawn_engine(&config.camera_device, config.file.camera.clone())?;

    let service = KioskService {
        pipeline,
        settings,
        search: Arc::new(SearchService::new(config.file.search.clone())),
        watcher: Arc::clone(&watcher),
        engine,
        printer: Printer::with_command(config.print_command.clone()),
        station: config.station.clone(),
        capture_dir: config.capture_dir(),
        jpeg_quality: processing.jpeg_quality,
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME}"))?;

    tracing::info!(bus = BUS_NAME, "photomatchd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("photomatchd shutting down");

    tokio::task::spawn_blocking(move || watcher.stop()).await?;

    Ok(())
}
