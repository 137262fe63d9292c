//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::imageops;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Wait after opening before the first read; early frames are often garbage.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
const DARK_THRESHOLD: f32 = 0.95;
const MAX_CAPTURE_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
}

/// Requested capture geometry and orientation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    pub width: u32,
    pub height: u32,
    /// Mirror horizontally (selfie view).
    pub flip: bool,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self { width: 1280, height: 720, flip: false }
    }
}

/// Exclusively owned V4L2 camera handle. The device closes on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    flip: bool,
}

impl Camera {
    /// Open a V4L2 capture device (e.g. "/dev/video0") and wait for it to settle.
    pub fn open(device_path: &str, options: &CameraOptions) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Prefer MJPG for full-resolution stills; accept YUYV if that is what the driver gives.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = options.width;
        fmt.height = options.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpg
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need MJPG or YUYV)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        std::thread::sleep(SETTLE_DELAY);

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            flip: options.flip,
        })
    }

    /// Capture one RGB frame, retrying past dark frames.
    ///
    /// Returns the first non-dark frame within a few attempts, otherwise
    /// the last frame read (flagged dark). Frame reads have no timeout.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let mut last = None;
        for _ in 0..MAX_CAPTURE_ATTEMPTS {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

            let mut image = self.buf_to_rgb(buf)?;
            if self.flip {
                imageops::flip_horizontal_in_place(&mut image);
            }
            let is_dark = frame::is_dark_frame(&image, DARK_THRESHOLD);
            let captured = Frame {
                image,
                timestamp: std::time::Instant::now(),
                sequence: meta.sequence,
                is_dark,
            };
            if !is_dark {
                return Ok(captured);
            }
            tracing::debug!(seq = meta.sequence, "skipping dark frame");
            last = Some(captured);
        }

        last.ok_or_else(|| CameraError::CaptureFailed("no frame captured".into()))
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<image::RgbImage, CameraError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf)
                .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}"))),
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/does-not-exist-video99", &CameraOptions::default()).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }
}
