//! presence-hw — Camera abstraction for the attendance kiosk.
//!
//! Defines the stream/backend traits the capture session drives, the
//! constraint-fallback acquisition sequence, and a V4L2 backend.

pub mod camera;
pub mod frame;
pub mod v4l2;

pub use camera::{
    acquire, CameraBackend, CameraError, Constraints, FacingMode, FallbackLevel, StreamInfo,
    StreamRequest, VideoSource,
};
pub use frame::Frame;
pub use v4l2::{list_devices, V4lBackend};
