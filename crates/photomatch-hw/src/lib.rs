//! photomatch-hw: Hardware collaborators: camera capture and printing.
//!
//! Provides V4L2-based still capture converted to RGB, and print job
//! submission through the system spooler.

pub mod camera;
pub mod frame;
pub mod printer;

pub use camera::{Camera, CameraError, CameraOptions, PixelFormat};
pub use frame::Frame;
pub use printer::{PrintError, Printer};
