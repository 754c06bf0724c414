//! Test doubles for the capture session: camera, extractor, reporter.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use presence_core::{AttendanceMode, BoundingBox, Embedding, EnrolledFace, Gallery};
use presence_hw::{
    CameraBackend, CameraError, FallbackLevel, Frame, StreamInfo, StreamRequest, VideoSource,
};
use presence_kiosk::{
    AttendanceReporter, CaptureSession, Detection, Extractor, ExtractorError, ReportError,
    SessionConfig, SessionDeps,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

#[derive(Default)]
pub struct CameraCounters {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub frame_requests: AtomicUsize,
}

/// Camera backend that counts acquisitions and releases.
#[derive(Default)]
pub struct FakeCamera {
    pub counters: Arc<CameraCounters>,
    pub unsupported: AtomicBool,
    pub never_ready: AtomicBool,
    pub dark: AtomicBool,
    pub open_error: Mutex<Option<CameraError>>,
    /// When set, every frame after the first waits for a permit.
    pub frame_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeCamera {
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn frame_requests(&self) -> usize {
        self.counters.frame_requests.load(Ordering::SeqCst)
    }
}

impl CameraBackend for FakeCamera {
    fn check_environment(&self) -> Result<(), CameraError> {
        if self.unsupported.load(Ordering::SeqCst) {
            Err(CameraError::Unsupported("no capture API".into()))
        } else {
            Ok(())
        }
    }

    fn open(&self, request: &StreamRequest) -> Result<Box<dyn VideoSource>, CameraError> {
        if let Some(e) = self.open_error.lock().clone() {
            return Err(e);
        }
        let c = &self.counters;
        c.opened.fetch_add(1, Ordering::SeqCst);
        let live = c.live.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeStream {
            info: StreamInfo {
                device: "/dev/fake0".into(),
                width: 4,
                height: 4,
                level: match request {
                    StreamRequest::Ideal(_) => FallbackLevel::Ideal,
                    StreamRequest::Relaxed { .. } => FallbackLevel::Relaxed,
                    StreamRequest::AnyDevice => FallbackLevel::AnyDevice,
                },
            },
            counters: c.clone(),
            released: AtomicBool::new(false),
            never_ready: self.never_ready.load(Ordering::SeqCst),
            dark: self.dark.load(Ordering::SeqCst),
            gate: self.frame_gate.lock().clone(),
            sequence: AtomicU32::new(0),
        }))
    }
}

pub struct FakeStream {
    info: StreamInfo,
    counters: Arc<CameraCounters>,
    released: AtomicBool,
    never_ready: bool,
    dark: bool,
    gate: Option<Arc<Semaphore>>,
    sequence: AtomicU32,
}

#[async_trait]
impl VideoSource for FakeStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_frame(&self) -> Result<Frame, CameraError> {
        self.counters.frame_requests.fetch_add(1, Ordering::SeqCst);
        if self.released.load(Ordering::SeqCst) {
            return Err(CameraError::Released);
        }
        if self.never_ready {
            return std::future::pending().await;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = self.gate.as_ref().filter(|_| sequence > 1) {
            gate.acquire().await.expect("gate closed").forget();
            if self.released.load(Ordering::SeqCst) {
                return Err(CameraError::Released);
            }
        }
        let luma = if self.dark { 0 } else { 128 };
        Ok(Frame::from_luma(vec![luma; 16], 4, 4, sequence))
    }

    fn stop(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extractor returning a fixed probe (or no face), optionally held on a gate.
pub struct FakeExtractor {
    probe: Mutex<Option<Vec<f32>>>,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn returning(probe: Option<Vec<f32>>) -> Arc<Self> {
        Arc::new(Self {
            probe: Mutex::new(probe),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn gated(probe: Option<Vec<f32>>, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            probe: Mutex::new(probe),
            gate: Some(gate),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn detect(&self, _frame: &Frame) -> Result<Option<Detection>, ExtractorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        Ok(self.probe.lock().clone().map(|values| Detection {
            embedding: Embedding::new(values),
            bounding_box: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence: 0.99,
            },
        }))
    }
}

/// Reporter that records calls and answers from a script (default: success).
#[derive(Default)]
pub struct FakeReporter {
    pub calls: Mutex<Vec<(String, AttendanceMode)>>,
    results: Mutex<VecDeque<Result<(), ReportError>>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(results: Vec<Result<(), ReportError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl AttendanceReporter for FakeReporter {
    async fn report(&self, employee_id: &str, mode: AttendanceMode) -> Result<(), ReportError> {
        self.calls.lock().push((employee_id.to_string(), mode));
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.results.lock().pop_front().unwrap_or(Ok(()))
    }
}

pub fn gallery(faces: &[(&str, &str, Vec<f32>)]) -> Arc<Gallery> {
    Arc::new(Gallery::new(
        faces
            .iter()
            .map(|(id, name, values)| EnrolledFace::new(*id, *name, Embedding::new(values.clone())))
            .collect(),
    ))
}

/// Gallery with one employee "E" enrolled at [1, 0, 0].
pub fn single_employee() -> Arc<Gallery> {
    gallery(&[("E", "Eka", vec![1.0, 0.0, 0.0])])
}

pub struct Harness {
    pub camera: Arc<FakeCamera>,
    pub extractor: Arc<FakeExtractor>,
    pub reporter: Arc<FakeReporter>,
    pub gallery_tx: watch::Sender<Arc<Gallery>>,
    pub session: CaptureSession,
}

pub fn harness(
    gallery: Arc<Gallery>,
    extractor: Arc<FakeExtractor>,
    reporter: Arc<FakeReporter>,
) -> Harness {
    harness_with_camera(Arc::new(FakeCamera::default()), gallery, extractor, reporter)
}

pub fn harness_with_camera(
    camera: Arc<FakeCamera>,
    gallery: Arc<Gallery>,
    extractor: Arc<FakeExtractor>,
    reporter: Arc<FakeReporter>,
) -> Harness {
    let (gallery_tx, gallery_rx) = watch::channel(gallery);
    let deps = SessionDeps {
        camera: camera.clone(),
        extractor: extractor.clone(),
        reporter: reporter.clone(),
        gallery: gallery_rx,
    };
    let session = CaptureSession::new(deps, SessionConfig::default());
    Harness {
        camera,
        extractor,
        reporter,
        gallery_tx,
        session,
    }
}

/// Poll `cond` on the (paused) clock until it holds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
