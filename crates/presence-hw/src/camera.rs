//! Camera acquisition with constraint fallback.
//!
//! A stream is first requested with the ideal constraints (resolution and
//! facing mode on the configured device). If the device rejects them the
//! request is relaxed to "any resolution on that device", and as a last
//! resort to "any video capture device". Permission and busy errors abort
//! immediately: a looser request cannot fix them.

use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("video capture unsupported on this system: {0}")]
    Unsupported(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("stream already released")]
    Released,
}

impl CameraError {
    /// Whether a looser request might succeed where this one failed.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            CameraError::ConstraintsUnsatisfiable(_) | CameraError::DeviceNotFound(_)
        )
    }
}

/// Which way the camera should face (kiosk cameras face the user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

/// Ideal stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Preferred device; `None` lets the backend pick its default.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub facing: Option<FacingMode>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            facing: Some(FacingMode::User),
        }
    }
}

/// How far acquisition had to back off from the ideal constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FallbackLevel {
    Ideal,
    Relaxed,
    AnyDevice,
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackLevel::Ideal => "ideal",
            FallbackLevel::Relaxed => "relaxed",
            FallbackLevel::AnyDevice => "any-device",
        };
        f.write_str(s)
    }
}

/// One acquisition request handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    /// Exact resolution and facing mode on the preferred device.
    Ideal(Constraints),
    /// Whatever the preferred device negotiates.
    Relaxed { device: Option<String> },
    /// Any video capture device at any resolution.
    AnyDevice,
}

impl StreamRequest {
    pub fn level(&self) -> FallbackLevel {
        match self {
            StreamRequest::Ideal(_) => FallbackLevel::Ideal,
            StreamRequest::Relaxed { .. } => FallbackLevel::Relaxed,
            StreamRequest::AnyDevice => FallbackLevel::AnyDevice,
        }
    }
}

/// What a backend actually opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub level: FallbackLevel,
}

/// A live camera stream. Owns the device until stopped or dropped.
///
/// `stop` may be called while a `next_frame` is pending on another task; the
/// device is released right away and the pending grab ends with
/// [`CameraError::Released`] or is abandoned by its caller.
#[async_trait]
pub trait VideoSource: Send + Sync {
    fn info(&self) -> &StreamInfo;

    /// Wait for the next frame.
    async fn next_frame(&self) -> Result<Frame, CameraError>;

    /// Release the device. Idempotent; implementations also release on drop.
    fn stop(&self);
}

/// Platform camera API.
pub trait CameraBackend: Send + Sync {
    /// Fails with [`CameraError::Unsupported`] when this system cannot capture video at all.
    fn check_environment(&self) -> Result<(), CameraError>;

    fn open(&self, request: &StreamRequest) -> Result<Box<dyn VideoSource>, CameraError>;
}

/// Open a stream, relaxing the constraints step by step when they are rejected.
pub fn acquire(
    backend: &dyn CameraBackend,
    constraints: &Constraints,
) -> Result<Box<dyn VideoSource>, CameraError> {
    let requests = [
        StreamRequest::Ideal(constraints.clone()),
        StreamRequest::Relaxed {
            device: constraints.device.clone(),
        },
        StreamRequest::AnyDevice,
    ];

    let mut last_err = None;
    for request in &requests {
        match backend.open(request) {
            Ok(stream) => {
                let info = stream.info();
                tracing::info!(
                    device = %info.device,
                    width = info.width,
                    height = info.height,
                    level = %info.level,
                    "camera stream acquired"
                );
                return Ok(stream);
            }
            Err(e) if e.allows_fallback() => {
                tracing::warn!(
                    level = %request.level(),
                    error = %e,
                    "camera request rejected; relaxing constraints"
                );
                last_err = Some(e);
            }
            Err(e) => {
                tracing::warn!(level = %request.level(), error = %e, "camera acquisition failed");
                return Err(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CameraError::DeviceNotFound("no video device".into())))
}
