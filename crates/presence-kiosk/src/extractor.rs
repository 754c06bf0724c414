//! Embedding extractor boundary.
//!
//! The face model itself is a third-party component. The session only needs
//! `detect(frame) -> embedding + box | nothing`, plus load failures that say
//! whether assets are missing, the runtime cannot run the model, or the
//! assets could not be fetched.

use crate::retry::{retry_load, RetryPolicy, Transient};
use async_trait::async_trait;
use presence_core::{BoundingBox, Embedding};
use presence_hw::Frame;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractorError {
    #[error("model assets missing in {dir}: {missing}; install the face model files there")]
    ModelNotFound { dir: String, missing: String },
    #[error("model runtime unsupported: {0}")]
    UnsupportedRuntime(String),
    #[error("model assets could not be fetched: {0}")]
    Network(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl Transient for ExtractorError {
    fn is_transient(&self) -> bool {
        matches!(self, ExtractorError::Network(_))
    }
}

/// One face found in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub embedding: Embedding,
    pub bounding_box: BoundingBox,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Find the most prominent face in `frame` and embed it. `Ok(None)` means no face.
    async fn detect(&self, frame: &Frame) -> Result<Option<Detection>, ExtractorError>;
}

/// Model files verified to exist at startup.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    dir: PathBuf,
}

impl ModelAssets {
    /// Check that every file in `required` exists under `dir`.
    pub fn locate(dir: &Path, required: &[&str]) -> Result<Self, ExtractorError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !dir.join(name).is_file())
            .collect();

        if !missing.is_empty() {
            return Err(ExtractorError::ModelNotFound {
                dir: dir.display().to_string(),
                missing: missing.join(", "),
            });
        }

        tracing::info!(dir = %dir.display(), files = required.len(), "model assets located");
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Locate the model assets, then build an extractor from them with `init`.
///
/// Missing assets fail at once. `init` is retried under `policy` while it
/// reports [`ExtractorError::Network`]; other errors are returned as they are.
pub async fn load_extractor<T, F, Fut>(
    dir: &Path,
    required: &[&str],
    policy: &RetryPolicy,
    mut init: F,
) -> Result<T, ExtractorError>
where
    F: FnMut(ModelAssets) -> Fut,
    Fut: Future<Output = Result<T, ExtractorError>>,
{
    let assets = ModelAssets::locate(dir, required)?;
    retry_load(policy, "face model", || init(assets.clone())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_locate_reports_missing_files() {
        let dir = std::env::temp_dir().join(format!("presence-models-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("detector.bin"), b"x").unwrap();

        let assets = ModelAssets::locate(&dir, &["detector.bin"]).unwrap();
        assert_eq!(assets.path("detector.bin"), dir.join("detector.bin"));

        let required = ["detector.bin", "embedder.bin", "landmarks.bin"];
        let err = ModelAssets::locate(&dir, &required).unwrap_err();
        match err {
            ExtractorError::ModelNotFound { missing, .. } => {
                assert_eq!(missing, "embedder.bin, landmarks.bin")
            }
            other => panic!("unexpected error: {other}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(ExtractorError::Network("timeout".into()).is_transient());
        assert!(!ExtractorError::UnsupportedRuntime("no SIMD".into()).is_transient());
        assert!(!ExtractorError::ModelNotFound {
            dir: "/x".into(),
            missing: "a".into()
        }
        .is_transient());
    }

    fn model_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("presence-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("embedder.bin"), b"x").unwrap();
        dir
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_extractor_retries_network_failures() {
        let dir = model_dir("load-retry");
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let loaded = load_extractor(&dir, &["embedder.bin"], &RetryPolicy::default(), |assets| {
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExtractorError::Network("mirror unreachable".into()))
                } else {
                    Ok(assets.path("embedder.bin"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(loaded, dir.join("embedder.bin"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_extractor_surfaces_permanent_failures() {
        let dir = model_dir("load-fatal");
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = load_extractor(&dir, &["embedder.bin"], &RetryPolicy::default(), |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ExtractorError::UnsupportedRuntime("no AVX2".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExtractorError::UnsupportedRuntime(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = load_extractor(&dir, &["detector.bin"], &RetryPolicy::default(), |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExtractorError::ModelNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
