//! presence-kiosk — Attendance kiosk orchestration.
//!
//! Wires the camera, a third-party embedding extractor, the cached face
//! gallery and the HR backend's attendance endpoint into one capture
//! session per check-in/check-out.

pub mod config;
pub mod extractor;
pub mod gallery;
mod http;
pub mod reporter;
pub mod retry;
pub mod session;

pub use config::{Config, ConfigError};
pub use extractor::{load_extractor, Detection, Extractor, ExtractorError, ModelAssets};
pub use gallery::{
    GalleryError, GalleryLoad, GalleryLoader, GalleryPolicy, GallerySource, HttpGallerySource,
};
pub use http::build_client;
pub use reporter::{AttendanceReporter, HttpReporter, ReportError};
pub use retry::{retry_load, RetryPolicy, Transient};
pub use session::{
    Activity, AttemptOutcome, CaptureSession, SessionConfig, SessionDeps, SessionError,
    SessionEvent, SessionSnapshot, SessionState, TerminationReason,
};
