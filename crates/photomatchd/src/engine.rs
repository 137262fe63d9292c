use photomatch_hw::{Camera, CameraError, CameraOptions, Frame};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn camera thread: {0}")]
    Spawn(std::io::Error),
    #[error("camera thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the camera thread.
enum EngineRequest {
    Capture {
        reply: oneshot::Sender<Result<Frame, EngineError>>,
    },
    Release {
        reply: oneshot::Sender<bool>,
    },
}

/// Clone-safe handle to the camera thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    device: String,
}

impl EngineHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Capture one still, opening the device first if needed.
    pub async fn capture(&self) -> Result<Frame, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Close the device so another process can claim it. Returns whether it was open.
    pub async fn release(&self) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Release { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the camera owner on a dedicated OS thread.
///
/// The device is opened on the first capture and kept open until a
/// release request, a capture failure, or the last handle is dropped.
pub fn spawn_engine(camera_device: &str, options: CameraOptions) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let device = camera_device.to_string();

    let thread_device = device.clone();
    std::thread::Builder::new()
        .name("photomatch-camera".into())
        .spawn(move || {
            tracing::info!(device = %thread_device, "camera thread started");
            let mut camera: Option<Camera> = None;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { reply } => {
                        let result = run_capture(&mut camera, &thread_device, &options);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Release { reply } => {
                        let _ = reply.send(camera.take().is_some());
                    }
                }
            }
            tracing::info!("camera thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, device })
}

/// Open on demand, capture, and drop the handle again if the device misbehaves.
fn run_capture(camera: &mut Option<Camera>, device: &str, options: &CameraOptions) -> Result<Frame, EngineError> {
    let cam = match camera.take() {
        Some(cam) => cam,
        None => {
            let opened = Camera::open(device, options)?;
            tracing::info!(
                device,
                width = opened.width,
                height = opened.height,
                fourcc = ?opened.fourcc,
                "camera opened"
            );
            opened
        }
    };

    let frame = cam.capture_frame()?;
    if frame.is_dark {
        tracing::warn!(seq = frame.sequence, "only dark frames available");
    }
    tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "frame captured");
    *camera = Some(cam);
    Ok(frame)
}
