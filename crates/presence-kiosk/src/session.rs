//! Capture session: camera lifecycle and the fixed-cadence recognition loop.
//!
//! ```text
//! Idle ─start─▶ Initializing ─first frame─▶ Active(Detecting ⇄ Recognizing) ─▶ Terminated
//!  ▲                 │ timeout / acquisition error                                │
//!  └─────────────────┘                                           start (restart) ┘
//! ```
//!
//! Every exit from `Initializing`/`Active` (match reported, `stop()`, fatal
//! error, drop) goes through [`Inner::terminate`], which bumps the session
//! generation, cancels the session token and releases the camera in one
//! place. The stream is registered with the session as soon as it is
//! acquired, so a stop while waiting for the first frame or during a grab
//! releases it immediately. Work that was already running checks the
//! generation after each await and backs out if it changed.

use crate::extractor::{Extractor, ExtractorError};
use crate::reporter::AttendanceReporter;
use parking_lot::Mutex;
use presence_core::{AttendanceMode, EuclideanMatcher, Gallery, Matcher};
use presence_hw::{
    acquire, CameraBackend, CameraError, Constraints, Frame, StreamInfo, VideoSource,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("environment not supported: {0}")]
    Environment(String),
    #[error("camera unavailable: {0}")]
    Acquisition(#[from] CameraError),
    #[error("camera produced no frame within {0:?}")]
    ReadyTimeout(Duration),
    #[error("a capture session is already running")]
    AlreadyActive,
    #[error("showing confirmation; a new session can start in {0:?}")]
    Confirming(Duration),
    #[error("session was stopped while starting")]
    Cancelled,
    #[error("session is not active")]
    NotActive,
    #[error("manual entry is not available yet")]
    ManualEntryLocked,
    #[error("employee id is empty")]
    InvalidEmployeeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub threshold: f32,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    /// Consecutive failed attempts that unlock manual entry. 0 disables it.
    pub manual_entry_after: u32,
    pub report_retry_delay: Duration,
    pub confirmation_window: Duration,
    pub constraints: Constraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threshold: presence_core::DEFAULT_MATCH_THRESHOLD,
            poll_interval: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(10),
            manual_entry_after: 5,
            report_retry_delay: Duration::from_secs(3),
            confirmation_window: Duration::from_secs(3),
            constraints: Constraints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Waiting for the next tick.
    Detecting,
    /// One recognition attempt (or report) in flight.
    Recognizing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    Recognized { employee_id: String, display_name: String },
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Initializing,
    Active(Activity),
    Terminated(TerminationReason),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active(_))
    }
}

/// Notifications for whatever renders the kiosk screen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    NoFace { consecutive_failures: u32 },
    NoMatch { consecutive_failures: u32 },
    ManualEntryUnlocked,
    /// `distance` is `None` for manual entries.
    Recognized {
        employee_id: String,
        display_name: String,
        distance: Option<f32>,
    },
    Reported {
        employee_id: String,
        display_name: String,
        mode: AttendanceMode,
    },
    ReportFailed { employee_id: String, reason: String },
}

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The session is not active (or stopped mid-attempt); nothing happened.
    Inactive,
    /// Another attempt or report is still in flight.
    Busy,
    NoFace,
    NoMatch,
    Reported { employee_id: String },
    ReportFailed { reason: String },
    /// The session terminated because of this attempt.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub mode: AttendanceMode,
    pub status: String,
    pub consecutive_failures: u32,
    pub manual_entry_available: bool,
    pub stream: Option<StreamInfo>,
}

/// Collaborators a session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub camera: Arc<dyn CameraBackend>,
    pub extractor: Arc<dyn Extractor>,
    pub reporter: Arc<dyn AttendanceReporter>,
    pub gallery: watch::Receiver<Arc<Gallery>>,
}

struct Core {
    state: SessionState,
    generation: u64,
    mode: AttendanceMode,
    status: String,
    consecutive_failures: u32,
    manual_unlocked: bool,
    confirm_until: Option<Instant>,
    /// Cancelled on termination; covers the first-frame wait and the loop.
    session_token: Option<CancellationToken>,
    stream_info: Option<StreamInfo>,
}

struct Inner {
    deps: SessionDeps,
    config: SessionConfig,
    matcher: EuclideanMatcher,
    // Lock order: `core` before `stream`.
    core: Mutex<Core>,
    stream: Mutex<Option<Arc<dyn VideoSource>>>,
    in_flight: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

/// Clears the in-flight flag when an attempt ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_current(&self, gen: u64) -> bool {
        let core = self.core.lock();
        core.generation == gen && core.state.is_active()
    }

    fn set_activity(&self, gen: u64, activity: Activity) {
        let changed = {
            let mut core = self.core.lock();
            if core.generation != gen || !core.state.is_active() {
                return;
            }
            let next = SessionState::Active(activity);
            let changed = core.state != next;
            core.state = next;
            changed
        };
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::Active(activity)));
        }
    }

    fn set_status(&self, gen: u64, status: impl Into<String>) {
        let mut core = self.core.lock();
        if core.generation == gen {
            core.status = status.into();
        }
    }

    /// A start attempt failed before reaching `Active`.
    fn abort_start(&self, gen: u64, status: String) {
        let stream = {
            let mut core = self.core.lock();
            if core.generation != gen || core.state != SessionState::Initializing {
                return;
            }
            core.state = SessionState::Idle;
            core.status = status;
            core.session_token = None;
            self.stream.lock().take()
        };
        if let Some(stream) = stream {
            stream.stop();
        }
        self.emit(SessionEvent::StateChanged(SessionState::Idle));
    }

    /// The single exit path out of `Initializing`/`Active`.
    ///
    /// With `expected_gen` set, does nothing if the session has already moved on.
    fn terminate(&self, expected_gen: Option<u64>, reason: TerminationReason) {
        let (token, stream) = {
            let mut core = self.core.lock();
            if expected_gen.is_some_and(|g| g != core.generation) {
                return;
            }
            if matches!(core.state, SessionState::Idle | SessionState::Terminated(_)) {
                return;
            }
            core.generation += 1;
            core.status = match &reason {
                TerminationReason::Recognized { display_name, .. } => {
                    format!("Welcome, {display_name}")
                }
                TerminationReason::Stopped => "Stopped".to_string(),
                TerminationReason::Failed(e) => format!("Error: {e}"),
            };
            if matches!(reason, TerminationReason::Recognized { .. }) {
                core.confirm_until = Some(Instant::now() + self.config.confirmation_window);
            }
            core.state = SessionState::Terminated(reason.clone());
            core.stream_info = None;
            (core.session_token.take(), self.stream.lock().take())
        };

        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(token) = token {
            token.cancel();
        }

        match &reason {
            TerminationReason::Failed(e) => {
                tracing::error!(error = %e, "capture session terminated")
            }
            _ => tracing::info!(reason = ?reason, "capture session terminated"),
        }
        self.emit(SessionEvent::StateChanged(SessionState::Terminated(reason)));
    }

    /// Grab one frame. `Ok(None)` if the session ended meanwhile.
    ///
    /// The stream stays registered during the grab so `terminate` can stop it.
    async fn grab_frame(&self, gen: u64) -> Result<Option<Frame>, CameraError> {
        let Some(stream) = self.stream.lock().clone() else {
            return Ok(None);
        };
        let result = stream.next_frame().await;
        if !self.is_current(gen) {
            return Ok(None);
        }
        result.map(Some)
    }

    async fn attempt(&self, gen: u64) -> AttemptOutcome {
        if !self.is_current(gen) {
            return AttemptOutcome::Inactive;
        }
        let Some(_in_flight) = InFlight::try_enter(&self.in_flight) else {
            tracing::debug!("recognition attempt already in flight; skipping");
            return AttemptOutcome::Busy;
        };
        self.set_activity(gen, Activity::Recognizing);

        let frame = match self.grab_frame(gen).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return AttemptOutcome::Inactive,
            Err(e) => {
                let reason = e.to_string();
                self.terminate(Some(gen), TerminationReason::Failed(reason.clone()));
                return AttemptOutcome::Failed { reason };
            }
        };

        let detection = if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "dark frame; skipping extractor");
            None
        } else {
            match self.deps.extractor.detect(&frame).await {
                Ok(detection) => detection,
                Err(
                    e @ (ExtractorError::UnsupportedRuntime(_)
                    | ExtractorError::ModelNotFound { .. }),
                ) => {
                    let reason = e.to_string();
                    self.terminate(Some(gen), TerminationReason::Failed(reason.clone()));
                    return AttemptOutcome::Failed { reason };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed");
                    None
                }
            }
        };

        if !self.is_current(gen) {
            return AttemptOutcome::Inactive;
        }

        let Some(detection) = detection else {
            return self.record_failure(gen, false);
        };

        let gallery = self.deps.gallery.borrow().clone();
        match self
            .matcher
            .find_best_match(&detection.embedding, &gallery, self.config.threshold)
        {
            Ok(Some(m)) => {
                self.report(gen, m.employee_id, m.display_name, Some(m.distance))
                    .await
            }
            Ok(None) => self.record_failure(gen, true),
            Err(e) => {
                let reason = e.to_string();
                self.terminate(Some(gen), TerminationReason::Failed(reason.clone()));
                AttemptOutcome::Failed { reason }
            }
        }
    }

    /// Count a failed attempt; unlock manual entry once the threshold is reached.
    fn record_failure(&self, gen: u64, face_found: bool) -> AttemptOutcome {
        let (count, unlocked_now) = {
            let mut core = self.core.lock();
            if core.generation != gen || !core.state.is_active() {
                return AttemptOutcome::Inactive;
            }
            core.consecutive_failures += 1;
            let threshold = self.config.manual_entry_after;
            let unlock = threshold > 0
                && !core.manual_unlocked
                && core.consecutive_failures >= threshold;
            if unlock {
                core.manual_unlocked = true;
            }
            core.status = if face_found {
                "Face not recognized, please try again".to_string()
            } else {
                "No face detected, please look at the camera".to_string()
            };
            (core.consecutive_failures, unlock)
        };

        if face_found {
            self.emit(SessionEvent::NoMatch {
                consecutive_failures: count,
            });
        } else {
            self.emit(SessionEvent::NoFace {
                consecutive_failures: count,
            });
        }
        if unlocked_now {
            tracing::info!(failures = count, "manual entry unlocked");
            self.emit(SessionEvent::ManualEntryUnlocked);
        }
        self.set_activity(gen, Activity::Detecting);

        if face_found {
            AttemptOutcome::NoMatch
        } else {
            AttemptOutcome::NoFace
        }
    }

    /// Report an accepted identification. Caller holds the in-flight guard.
    async fn report(
        &self,
        gen: u64,
        employee_id: String,
        display_name: String,
        distance: Option<f32>,
    ) -> AttemptOutcome {
        let mode = {
            let mut core = self.core.lock();
            if core.generation != gen || !core.state.is_active() {
                return AttemptOutcome::Inactive;
            }
            core.consecutive_failures = 0;
            core.status = format!("Recognized {display_name}, recording {}", core.mode);
            core.mode
        };
        tracing::info!(employee_id = %employee_id, ?distance, %mode, "employee recognized");
        self.emit(SessionEvent::Recognized {
            employee_id: employee_id.clone(),
            display_name: display_name.clone(),
            distance,
        });

        let result = self.deps.reporter.report(&employee_id, mode).await;

        if !self.is_current(gen) {
            return AttemptOutcome::Inactive;
        }

        match result {
            Ok(()) => {
                self.emit(SessionEvent::Reported {
                    employee_id: employee_id.clone(),
                    display_name: display_name.clone(),
                    mode,
                });
                self.terminate(
                    Some(gen),
                    TerminationReason::Recognized {
                        employee_id: employee_id.clone(),
                        display_name,
                    },
                );
                AttemptOutcome::Reported { employee_id }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    employee_id = %employee_id,
                    reason = %reason,
                    "attendance report failed"
                );
                self.set_status(gen, reason.clone());
                self.emit(SessionEvent::ReportFailed {
                    employee_id,
                    reason: reason.clone(),
                });
                // Recognition stays suppressed while the error is on screen.
                tokio::time::sleep(self.config.report_retry_delay).await;
                self.set_status(gen, "Please look at the camera");
                self.set_activity(gen, Activity::Detecting);
                AttemptOutcome::ReportFailed { reason }
            }
        }
    }

    async fn run_loop(self: Arc<Self>, gen: u64, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_current(gen) {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.attempt(gen) => {
                    tracing::trace!(?outcome, "recognition attempt finished");
                }
            }
        }
        tracing::debug!(generation = gen, "detection loop exited");
    }
}

/// One kiosk camera session. Dropping it releases the camera.
pub struct CaptureSession {
    inner: Arc<Inner>,
}

impl CaptureSession {
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                matcher: EuclideanMatcher,
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    generation: 0,
                    mode: AttendanceMode::CheckIn,
                    status: String::new(),
                    consecutive_failures: 0,
                    manual_unlocked: false,
                    confirm_until: None,
                    session_token: None,
                    stream_info: None,
                }),
                stream: Mutex::new(None),
                in_flight: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.inner.core.lock();
        SessionSnapshot {
            state: core.state.clone(),
            mode: core.mode,
            status: core.status.clone(),
            consecutive_failures: core.consecutive_failures,
            manual_entry_available: core.manual_unlocked,
            stream: core.stream_info.clone(),
        }
    }

    /// Acquire the camera and start the detection loop.
    ///
    /// Valid from `Idle` or `Terminated`; a terminated session restarts with
    /// fresh counters. Returns once the first frame arrived.
    pub async fn start(&self, mode: AttendanceMode) -> Result<(), SessionError> {
        let inner = &self.inner;
        let token = CancellationToken::new();
        let gen = {
            let mut core = inner.core.lock();
            if matches!(core.state, SessionState::Initializing | SessionState::Active(_)) {
                return Err(SessionError::AlreadyActive);
            }
            if let Some(until) = core.confirm_until {
                let now = Instant::now();
                if now < until {
                    return Err(SessionError::Confirming(until - now));
                }
            }
            core.generation += 1;
            core.state = SessionState::Initializing;
            core.mode = mode;
            core.status = "Starting camera".to_string();
            core.consecutive_failures = 0;
            core.manual_unlocked = false;
            core.confirm_until = None;
            core.session_token = Some(token.clone());
            core.generation
        };
        inner.emit(SessionEvent::StateChanged(SessionState::Initializing));
        tracing::info!(%mode, generation = gen, "starting capture session");

        if let Err(e) = inner.deps.camera.check_environment() {
            inner.abort_start(gen, format!("Camera not supported: {e}"));
            return Err(SessionError::Environment(e.to_string()));
        }

        // At most one stream: drop anything left over before opening a new one.
        if let Some(old) = inner.stream.lock().take() {
            old.stop();
        }

        let stream: Arc<dyn VideoSource> =
            match acquire(inner.deps.camera.as_ref(), &inner.config.constraints) {
                Ok(stream) => Arc::from(stream),
                Err(e) => {
                    inner.abort_start(gen, format!("Camera unavailable: {e}"));
                    return Err(e.into());
                }
            };

        // Register the stream before waiting so a stop can release it.
        {
            let core = inner.core.lock();
            if core.generation != gen || core.state != SessionState::Initializing {
                drop(core);
                stream.stop();
                return Err(SessionError::Cancelled);
            }
            *inner.stream.lock() = Some(stream.clone());
        }

        let ready = tokio::select! {
            _ = token.cancelled() => {
                stream.stop();
                return Err(SessionError::Cancelled);
            }
            ready = tokio::time::timeout(inner.config.ready_timeout, stream.next_frame()) => ready,
        };
        let failure = match ready {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(SessionError::Acquisition(e)),
            Err(_) => Some(SessionError::ReadyTimeout(inner.config.ready_timeout)),
        };
        if let Some(err) = failure {
            tracing::warn!(error = %err, "camera did not become ready");
            inner.abort_start(gen, err.to_string());
            stream.stop();
            return Err(err);
        }

        {
            let mut core = inner.core.lock();
            if core.generation != gen || core.state != SessionState::Initializing {
                drop(core);
                stream.stop();
                return Err(SessionError::Cancelled);
            }
            core.state = SessionState::Active(Activity::Detecting);
            core.status = "Please look at the camera".to_string();
            core.stream_info = Some(stream.info().clone());
        }
        inner.emit(SessionEvent::StateChanged(SessionState::Active(Activity::Detecting)));

        tokio::spawn(inner.clone().run_loop(gen, token));
        Ok(())
    }

    /// Run one recognition attempt now, outside the polling cadence.
    pub async fn recognize_now(&self) -> AttemptOutcome {
        let gen = self.inner.core.lock().generation;
        self.inner.attempt(gen).await
    }

    /// Record attendance for an operator-typed employee id.
    ///
    /// Only available while active and after enough consecutive failures.
    pub async fn submit_manual(&self, employee_id: &str) -> Result<AttemptOutcome, SessionError> {
        let employee_id = employee_id.trim();
        if employee_id.is_empty() {
            return Err(SessionError::InvalidEmployeeId);
        }
        let gen = {
            let core = self.inner.core.lock();
            if !core.state.is_active() {
                return Err(SessionError::NotActive);
            }
            if !core.manual_unlocked {
                return Err(SessionError::ManualEntryLocked);
            }
            core.generation
        };
        let Some(_in_flight) = InFlight::try_enter(&self.inner.in_flight) else {
            return Ok(AttemptOutcome::Busy);
        };
        self.inner.set_activity(gen, Activity::Recognizing);

        let display_name = self
            .inner
            .deps
            .gallery
            .borrow()
            .get(employee_id)
            .map(|f| f.display_name.clone())
            .unwrap_or_else(|| employee_id.to_string());
        tracing::info!(employee_id, "manual entry submitted");

        Ok(self
            .inner
            .report(gen, employee_id.to_string(), display_name, None)
            .await)
    }

    /// Stop the session and release the camera. Idempotent.
    pub fn stop(&self) {
        self.inner.terminate(None, TerminationReason::Stopped);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.inner.terminate(None, TerminationReason::Stopped);
    }
}
