//! Face gallery loading, caching and periodic refresh.
//!
//! The current gallery is published through a `watch` channel as an
//! `Arc<Gallery>`. A refresh swaps the whole `Arc`; a match already holding
//! the previous snapshot keeps using it untouched.

use crate::http::with_token;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use presence_core::{Gallery, GalleryParseError};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery request failed: {0}")]
    Network(String),
    #[error("gallery endpoint returned HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Parse(#[from] GalleryParseError),
}

/// Where enrolled faces come from. Returns the raw response body.
#[async_trait]
pub trait GallerySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, GalleryError>;
}

/// `GET <url>` against the HR backend.
pub struct HttpGallerySource {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpGallerySource {
    pub fn new(client: Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl GallerySource for HttpGallerySource {
    async fn fetch(&self) -> Result<Vec<u8>, GalleryError> {
        let request = with_token(self.client.get(&self.url), self.token.as_deref());
        let response = request
            .send()
            .await
            .map_err(|e| GalleryError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GalleryError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GalleryError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Refresh cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalleryPolicy {
    pub refresh_interval: Duration,
    pub retry_delay: Duration,
    /// Consecutive failures retried at `retry_delay` before falling back to `refresh_interval`.
    pub retry_limit: u32,
}

impl Default for GalleryPolicy {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            retry_limit: 5,
        }
    }
}

/// Result of one load attempt.
#[derive(Debug)]
pub struct GalleryLoad {
    /// Fresh gallery on success; otherwise the last good one (possibly empty).
    pub gallery: Arc<Gallery>,
    pub error: Option<GalleryError>,
    /// When the next load is scheduled.
    pub next_load_in: Duration,
}

impl GalleryLoad {
    pub fn is_fresh(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct LoaderState {
    last_loaded_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

pub struct GalleryLoader {
    source: Arc<dyn GallerySource>,
    expected_dim: Option<usize>,
    policy: GalleryPolicy,
    tx: watch::Sender<Arc<Gallery>>,
    state: Mutex<LoaderState>,
    wake: Notify,
}

impl GalleryLoader {
    pub fn new(
        source: Arc<dyn GallerySource>,
        expected_dim: Option<usize>,
        policy: GalleryPolicy,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(Gallery::empty()));
        Self {
            source,
            expected_dim,
            policy,
            tx,
            state: Mutex::new(LoaderState::default()),
            wake: Notify::new(),
        }
    }

    /// Receiver that always sees the latest gallery.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Gallery>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<Gallery> {
        self.tx.borrow().clone()
    }

    pub fn last_loaded_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_loaded_at
    }

    /// Fetch and publish the gallery. Never fails: on error the cached copy stays in place.
    pub async fn load(&self) -> GalleryLoad {
        let result = match self.source.fetch().await {
            Ok(body) => Gallery::from_slice(&body, self.expected_dim).map_err(GalleryError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(gallery) => {
                let now = Utc::now();
                let gallery = Arc::new(gallery.with_loaded_at(now));
                tracing::info!(
                    faces = gallery.len(),
                    usable = gallery.usable_len(),
                    "gallery loaded"
                );
                self.tx.send_replace(gallery.clone());

                let mut state = self.state.lock();
                state.last_loaded_at = Some(now);
                state.consecutive_failures = 0;

                GalleryLoad {
                    gallery,
                    error: None,
                    next_load_in: self.policy.refresh_interval,
                }
            }
            Err(e) => {
                let failures = {
                    let mut state = self.state.lock();
                    state.consecutive_failures += 1;
                    state.consecutive_failures
                };
                let next_load_in = if failures <= self.policy.retry_limit {
                    self.policy.retry_delay
                } else {
                    self.policy.refresh_interval
                };
                let stale = self.current();
                tracing::warn!(
                    error = %e,
                    failures,
                    cached_faces = stale.len(),
                    retry_in_secs = next_load_in.as_secs_f32(),
                    "gallery load failed; keeping cached gallery"
                );
                GalleryLoad {
                    gallery: stale,
                    error: Some(e),
                    next_load_in,
                }
            }
        }
    }

    /// Ask the refresh task to reload now instead of waiting for its timer.
    pub fn refresh_now(&self) {
        self.wake.notify_one();
    }

    /// Load immediately, then keep refreshing on the loader's own timer until `shutdown` fires.
    pub fn spawn_refresh(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let outcome = self.load().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(outcome.next_load_in) => {}
                    _ = self.wake.notified() => {
                        tracing::debug!("on-demand gallery refresh");
                    }
                }
            }
            tracing::debug!("gallery refresh task stopped");
        })
    }
}
