use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `KioskProxy` (async) and `KioskProxyBlocking`.
#[zbus::proxy(
    interface = "org.photomatch.Kiosk1",
    default_service = "org.photomatch.Kiosk1",
    default_path = "/org/photomatch/Kiosk1"
)]
trait Kiosk {
    async fn process_image(&self, path: &str, station: &str) -> zbus::Result<String>;
    async fn process_pending(&self, station: &str) -> zbus::Result<String>;
    async fn search(&self, request: &str) -> zbus::Result<String>;
    async fn search_camera(&self, request: &str) -> zbus::Result<String>;
    async fn list(&self, limit: u32, offset: u32) -> zbus::Result<String>;
    async fn get(&self, id: &str) -> zbus::Result<String>;
    async fn delete(&self, id: &str) -> zbus::Result<bool>;
    async fn delete_all(&self) -> zbus::Result<u32>;
    async fn watcher_start(&self) -> zbus::Result<bool>;
    async fn watcher_stop(&self) -> zbus::Result<bool>;
    async fn cleanup_scratch(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
    async fn capture(&self) -> zbus::Result<String>;
    async fn release_camera(&self) -> zbus::Result<bool>;
    async fn print(&self, path: &str, printer: &str, copies: u32) -> zbus::Result<bool>;
    async fn get_settings(&self, station: &str) -> zbus::Result<String>;
    async fn save_settings(&self, station: &str, category: &str, value: &str) -> zbus::Result<()>;
    async fn delete_settings(&self, station: &str, category: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "photomatch", about = "Photo kiosk analysis and search CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one photo and store it
    Process {
        path: PathBuf,
        /// Station whose crop and clothing settings apply
        #[arg(short, long, default_value = "")]
        station: String,
    },
    /// Process every intake photo not yet stored
    Pending {
        #[arg(short, long, default_value = "")]
        station: String,
    },
    /// Search stored photos by face and/or clothing color
    Search {
        /// Photo of the person to look for
        #[arg(long)]
        face: Option<PathBuf>,
        /// Clothing color as #rrggbb (repeatable)
        #[arg(short, long = "color")]
        colors: Vec<String>,
        #[arg(long)]
        face_weight: Option<f64>,
        #[arg(long)]
        color_weight: Option<f64>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long)]
        station: Option<String>,
        /// Take the face from a fresh camera capture
        #[arg(long, conflicts_with = "face")]
        camera: bool,
    },
    /// List stored photos, newest first
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
        #[arg(short, long, default_value_t = 0)]
        offset: u32,
    },
    /// Show one stored record in full
    Show { id: String },
    /// Delete one stored record
    Delete { id: String },
    /// Delete every stored record
    Clear {
        /// Confirm the bulk delete
        #[arg(long)]
        yes: bool,
    },
    /// Control the intake folder watcher
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
    /// Show daemon status
    Status,
    /// Capture a still from the kiosk camera
    Capture {
        /// Close the camera afterwards
        #[arg(long)]
        release: bool,
    },
    /// Print a photo
    Print {
        path: PathBuf,
        #[arg(short, long, default_value = "")]
        printer: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        copies: u32,
    },
    /// Remove leftover scratch files
    Cleanup,
    /// Per-station settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum WatchAction {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show all settings of a station
    Show {
        #[arg(default_value = "")]
        station: String,
    },
    /// Store a JSON blob for a category (crop, clothing, search)
    Set {
        category: String,
        value: String,
        #[arg(short, long, default_value = "")]
        station: String,
    },
    /// Remove a category
    Delete {
        category: String,
        #[arg(short, long, default_value = "")]
        station: String,
    },
}

/// The daemon resolves paths from its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(path.display().to_string())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let kiosk = KioskProxy::new(&conn).await?;

    match cli.command {
        Commands::Process { path, station } => {
            print_json(&kiosk.process_image(&absolute(&path)?, &station).await?)?;
        }
        Commands::Pending { station } => {
            print_json(&kiosk.process_pending(&station).await?)?;
        }
        Commands::Search { face, colors, face_weight, color_weight, limit, station, camera } => {
            let face_image = face.as_deref().map(absolute).transpose()?;
            if face_image.is_none() && colors.is_empty() && !camera {
                bail!("give --face, --camera or at least one --color");
            }
            let request = serde_json::json!({
                "face_image": face_image,
                "colors": colors,
                "face_weight": face_weight,
                "color_weight": color_weight,
                "max_results": limit,
                "station": station,
            })
            .to_string();
            let response = if camera {
                kiosk.search_camera(&request).await?
            } else {
                kiosk.search(&request).await?
            };
            print_json(&response)?;
        }
        Commands::List { limit, offset } => {
            print_json(&kiosk.list(limit, offset).await?)?;
        }
        Commands::Show { id } => {
            print_json(&kiosk.get(&id).await?)?;
        }
        Commands::Delete { id } => {
            if kiosk.delete(&id).await? {
                println!("Deleted {id}");
            } else {
                bail!("no record with id {id}");
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every record without --yes");
            }
            let removed = kiosk.delete_all().await?;
            println!("Deleted {removed} records");
        }
        Commands::Watch { action: WatchAction::Start } => {
            if kiosk.watcher_start().await? {
                println!("Watcher started");
            } else {
                println!("Watcher not started (already running or folder unavailable)");
            }
        }
        Commands::Watch { action: WatchAction::Stop } => {
            if kiosk.watcher_stop().await? {
                println!("Watcher stopped");
            } else {
                println!("Watcher was not running");
            }
        }
        Commands::Status => {
            print_json(&kiosk.status().await?)?;
        }
        Commands::Capture { release } => {
            println!("{}", kiosk.capture().await?);
            if release {
                kiosk.release_camera().await?;
            }
        }
        Commands::Print { path, printer, copies } => {
            if !kiosk.print(&absolute(&path)?, &printer, copies).await? {
                bail!("print job failed");
            }
            println!("Sent to printer");
        }
        Commands::Cleanup => {
            let deleted = kiosk.cleanup_scratch().await?;
            println!("Removed {deleted} scratch files");
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show { station } => {
                print_json(&kiosk.get_settings(&station).await?)?;
            }
            SettingsAction::Set { category, value, station } => {
                serde_json::from_str::<serde_json::Value>(&value).context("value must be JSON")?;
                kiosk.save_settings(&station, &category, &value).await?;
                println!("Saved {category}");
            }
            SettingsAction::Delete { category, station } => {
                if kiosk.delete_settings(&station, &category).await? {
                    println!("Deleted {category}");
                } else {
                    println!("No {category} settings stored");
                }
            }
        },
    }

    Ok(())
}
