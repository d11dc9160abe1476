// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测流水线 (Detection pipeline)
///
/// One dedicated worker per run, strictly sequential:
/// pull → infer → annotate → write → publish
///
/// The control side only calls `start`/`stop` and reads status or the
/// delivery channel. The stop flag is the only state both sides write to
/// drive the run; source and sink belong to the worker until teardown.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

use crate::annotate::Annotator;
use crate::config::{PipelineConfig, PipelineSettings};
use crate::delivery::{Delivery, DeliveryChannel, DeliveryReceiver, PublishOutcome};
use crate::detector::{Detector, ModelHandle};
use crate::error::{ConfigError, InferenceError, PipelineError, Result, SourceError, WriteError};
use crate::frame::{DetectionSet, Frame};
use crate::sink::{open_sink, ResultSink};
use crate::source::{open_source, FrameSource};

/// Lifecycle of a pipeline instance. `Stopped` and `Failed` are terminal
/// for a run; a new `start` (or `reset`) begins the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running | RunState::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Failed)
    }
}

/// Per-run frame accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub frames_published: u64,
    /// Published frames replaced before the consumer took them.
    pub frames_overwritten: u64,
    /// Frames whose inference failed after all retries.
    pub inference_errors: u64,
    /// Source ended early because of a decode failure.
    pub source_partial_failure: bool,
}

/// Snapshot of the current (or last) run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub state: RunState,
    pub last_error: Option<String>,
    pub stats: RunStats,
    pub source: Option<PathBuf>,
    /// Set once the first frame has been written.
    pub output_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            last_error: None,
            stats: RunStats::default(),
            source: None,
            output_path: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Serialisable summary written by the binary after a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub last_error: Option<String>,
    pub stats: RunStats,
    pub source: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl From<RunStatus> for RunReport {
    fn from(status: RunStatus) -> Self {
        Self {
            state: status.state,
            last_error: status.last_error,
            stats: status.stats,
            source: status.source,
            output_path: status.output_path,
            started_at: status.started_at.map(|t| t.to_rfc3339()),
            finished_at: status.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    status: Mutex<RunStatus>,
    changed: Condvar,
    /// Model handed back by the worker when a run ends.
    model: Mutex<Option<ModelHandle>>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut RunStatus)) {
        let mut status = lock(&self.status);
        f(&mut status);
        self.changed.notify_all();
    }

    fn state(&self) -> RunState {
        lock(&self.status).state
    }
}

/// 检测流水线控制器
pub struct DetectionPipeline {
    settings: PipelineSettings,
    annotator: Arc<Annotator>,
    delivery: DeliveryChannel,
    shared: Arc<Shared>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionPipeline {
    pub fn new(settings: PipelineSettings) -> std::result::Result<Self, ConfigError> {
        let annotator = Annotator::from_settings(&settings)?;
        Ok(Self::with_annotator(settings, annotator))
    }

    pub fn with_annotator(settings: PipelineSettings, annotator: Annotator) -> Self {
        Self {
            settings,
            annotator: Arc::new(annotator),
            delivery: DeliveryChannel::new(),
            shared: Arc::new(Shared {
                status: Mutex::new(RunStatus::default()),
                changed: Condvar::new(),
                model: Mutex::new(None),
            }),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Consumer end of the latest-frame channel.
    pub fn subscribe(&self) -> DeliveryReceiver {
        self.delivery.receiver()
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.shared.status).clone()
    }

    /// Human-readable cause of the last `Failed` run.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.status).last_error.clone()
    }

    pub fn stats(&self) -> RunStats {
        lock(&self.shared.status).stats.clone()
    }

    pub fn report(&self) -> RunReport {
        self.status().into()
    }

    /// Opens the configured source and sink and begins a run.
    ///
    /// Fails with `AlreadyRunning` while a run is active. A source that
    /// cannot be opened ends the run in `Failed` before any frame is pulled.
    pub fn start(&self, config: &PipelineConfig, detector: ModelHandle) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.ensure_idle(&mut worker)?;

        let source = match open_source(config, &self.settings) {
            Ok(source) => source,
            Err(e) => {
                error!("❌ cannot open source {}: {}", config.source_path().display(), e);
                let err = PipelineError::SourceUnavailable(e);
                self.shared.update(|s| {
                    *s = RunStatus {
                        state: RunState::Failed,
                        last_error: Some(err.to_string()),
                        source: Some(config.source_path().to_path_buf()),
                        started_at: Some(Utc::now()),
                        finished_at: Some(Utc::now()),
                        ..RunStatus::default()
                    };
                });
                *lock(&self.shared.model) = Some(detector);
                return Err(err);
            }
        };
        let sink = open_sink(config, &self.settings, source.metadata());
        self.launch(&mut worker, config, detector, source, sink)
    }

    /// Like [`DetectionPipeline::start`] with caller-supplied source and sink.
    pub fn start_with(
        &self,
        config: &PipelineConfig,
        detector: ModelHandle,
        source: Box<dyn FrameSource>,
        sink: Box<dyn ResultSink>,
    ) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.ensure_idle(&mut worker)?;
        self.launch(&mut worker, config, detector, source, sink)
    }

    fn ensure_idle(&self, worker: &mut Option<JoinHandle<()>>) -> Result<()> {
        if self.shared.state().is_active() {
            return Err(PipelineError::AlreadyRunning);
        }
        // terminal state is published after teardown, so this join is brief
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("⚠️  previous worker panicked after teardown");
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        worker: &mut Option<JoinHandle<()>>,
        config: &PipelineConfig,
        detector: ModelHandle,
        source: Box<dyn FrameSource>,
        sink: Box<dyn ResultSink>,
    ) -> Result<()> {
        self.stop_flag.store(false, Ordering::SeqCst);
        self.delivery.clear();
        self.shared.update(|s| {
            *s = RunStatus {
                state: RunState::Running,
                source: Some(config.source_path().to_path_buf()),
                started_at: Some(Utc::now()),
                ..RunStatus::default()
            };
        });

        let run = Worker {
            config: config.clone(),
            retries: self.settings.inference_retries,
            annotator: Arc::clone(&self.annotator),
            delivery: self.delivery.clone(),
            shared: Arc::clone(&self.shared),
            stop_flag: Arc::clone(&self.stop_flag),
        };
        let resources = RunResources::new(source, sink);

        // a failed spawn drops the closure; RunResources closes source and sink on drop
        let spawned = thread::Builder::new()
            .name("detection-worker".to_string())
            .spawn(move || run.run(detector, resources));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = PipelineError::Worker(format!("failed to spawn worker: {}", e));
                self.shared.update(|s| {
                    s.state = RunState::Failed;
                    s.last_error = Some(err.to_string());
                    s.finished_at = Some(Utc::now());
                });
                Err(err)
            }
        }
    }

    /// Requests cooperative cancellation and waits for teardown.
    ///
    /// The worker notices the request before its next pull, so this returns
    /// within one frame-processing interval. No-op when no run is active.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        {
            let mut status = lock(&self.shared.status);
            match status.state {
                RunState::Running => {
                    status.state = RunState::Stopping;
                    self.shared.changed.notify_all();
                }
                RunState::Stopping => {}
                _ => return,
            }
        }
        info!("🛑 stop requested");
        self.stop_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("❌ worker panicked during shutdown");
            }
        }
    }

    /// Blocks until the current run reaches a terminal state (or there is
    /// no run). Does not cancel anything.
    pub fn wait(&self) -> RunState {
        let mut status = lock(&self.shared.status);
        while status.state.is_active() {
            status = self
                .shared
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        status.state
    }

    /// Like [`DetectionPipeline::wait`] with a deadline; returns the state
    /// observed when it gives up.
    pub fn wait_timeout(&self, timeout: Duration) -> RunState {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.shared.status);
        while status.state.is_active() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            status = guard;
        }
        status.state
    }

    /// Takes back the model used by the last run. Models can only change
    /// hands while no run is active.
    pub fn take_model(&self) -> Result<Option<ModelHandle>> {
        let _worker = lock(&self.worker);
        if self.shared.state().is_active() {
            return Err(PipelineError::AlreadyRunning);
        }
        Ok(lock(&self.shared.model).take())
    }

    /// Returns a finished pipeline to `Idle`, clearing the last error.
    pub fn reset(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.ensure_idle(&mut worker)?;
        self.shared.update(|s| *s = RunStatus::default());
        self.delivery.clear();
        Ok(())
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

/// Source and sink of one run. Closed exactly once, by `teardown` or on drop.
struct RunResources {
    source: Box<dyn FrameSource>,
    sink: Box<dyn ResultSink>,
    torn_down: bool,
}

impl RunResources {
    fn new(source: Box<dyn FrameSource>, sink: Box<dyn ResultSink>) -> Self {
        Self {
            source,
            sink,
            torn_down: false,
        }
    }

    fn teardown(&mut self) -> std::result::Result<(), WriteError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.source.close();
        let closed = self.sink.close();
        debug!("teardown complete ({} frames in output)", self.sink.frames_written());
        closed
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("⚠️  sink close during unwind failed: {}", e);
        }
    }
}

enum Outcome {
    EndOfStream,
    Cancelled,
    Failed(PipelineError),
}

struct Worker {
    config: PipelineConfig,
    retries: u32,
    annotator: Arc<Annotator>,
    delivery: DeliveryChannel,
    shared: Arc<Shared>,
    stop_flag: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, mut detector: ModelHandle, mut io: RunResources) {
        let span = info_span!(
            "pipeline.run",
            source = %self.config.source_path().display(),
            video = self.config.is_video(),
            detector = detector.name()
        );
        let _enter = span.enter();
        info!(
            "🚀 run started (conf {:.2}, retries {})",
            self.config.confidence_threshold(),
            self.retries
        );

        let looped = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pull_loop(&mut detector, &mut io)
        }));
        let (outcome, detector) = match looped {
            Ok(outcome) => (outcome, Some(detector)),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                (
                    Outcome::Failed(PipelineError::Worker(format!("worker panicked: {}", msg))),
                    None,
                )
            }
        };

        if matches!(outcome, Outcome::EndOfStream) {
            self.shared.update(|s| {
                if s.state == RunState::Running {
                    s.state = RunState::Stopping;
                }
            });
        }

        let closed = io.teardown();
        let partial = io.source.partial_failure();
        let written = io.sink.frames_written();

        let failure = match outcome {
            Outcome::Failed(e) => Some(e),
            Outcome::EndOfStream | Outcome::Cancelled => closed.err().map(PipelineError::from),
        };

        if let Some(detector) = detector {
            *lock(&self.shared.model) = Some(detector);
        }

        self.shared.update(|s| {
            s.stats.source_partial_failure = partial;
            s.stats.frames_written = written;
            s.finished_at = Some(Utc::now());
            match &failure {
                Some(e) => {
                    s.state = RunState::Failed;
                    s.last_error = Some(e.to_string());
                }
                None => s.state = RunState::Stopped,
            }
        });

        let stats = lock(&self.shared.status).stats.clone();
        match failure {
            Some(e) => error!(
                "❌ run failed after {} frames read / {} written: {}",
                stats.frames_read, stats.frames_written, e
            ),
            None => info!(
                "✅ run finished: {} read | {} written | {} published | {} inference errors{}",
                stats.frames_read,
                stats.frames_written,
                stats.frames_published,
                stats.inference_errors,
                if partial { " | source ended early" } else { "" }
            ),
        }
    }

    fn pull_loop(&self, detector: &mut ModelHandle, io: &mut RunResources) -> Outcome {
        let threshold = self.config.confidence_threshold();
        let mut count = 0u64;
        let mut infer_ms = 0.0f64;
        let mut last = Instant::now();
        let mut pulled = 0u64;

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("🛑 stop observed, leaving loop");
                return Outcome::Cancelled;
            }

            let Some(frame) = io.source.next_frame() else {
                if pulled == 0 && io.source.partial_failure() {
                    let err = SourceError::Decode(format!(
                        "{}: decoder failed before the first frame",
                        self.config.source_path().display()
                    ));
                    return Outcome::Failed(err.into());
                }
                debug!("end of stream");
                return Outcome::EndOfStream;
            };
            pulled += 1;
            self.shared.update(|s| s.stats.frames_read += 1);

            let started = Instant::now();
            let detections = match self.infer(detector, &frame, threshold) {
                Ok(detections) => detections,
                Err(e) => {
                    warn!(
                        "⚠️  frame #{} skipped annotation after {} attempt(s): {}",
                        frame.index(),
                        self.retries + 1,
                        e
                    );
                    self.shared.update(|s| s.stats.inference_errors += 1);
                    DetectionSet::empty()
                }
            };
            infer_ms = started.elapsed().as_secs_f64() * 1000.0;

            let annotated = self.annotator.apply(frame, &detections);
            if let Err(e) = io.sink.write(&annotated) {
                error!("❌ write failed at frame #{}: {}", annotated.index(), e);
                return Outcome::Failed(e.into());
            }
            let output_path = io.sink.output_path();
            self.shared.update(|s| {
                s.stats.frames_written += 1;
                if s.output_path.is_none() {
                    s.output_path = Some(output_path.to_path_buf());
                }
            });

            let outcome = self.delivery.publish(Delivery {
                frame: annotated,
                detections,
            });
            self.shared.update(|s| {
                s.stats.frames_published += 1;
                if outcome == PublishOutcome::Replaced {
                    s.stats.frames_overwritten += 1;
                }
            });

            count += 1;
            if last.elapsed().as_secs_f64() >= 1.0 {
                let elapsed = last.elapsed().as_secs_f64();
                info!(
                    "📊 processed {} frames | {:.1} fps | last inference {:.1} ms",
                    count,
                    count as f64 / elapsed,
                    infer_ms
                );
                last = Instant::now();
                count = 0;
            }
        }
    }

    fn infer(
        &self,
        detector: &mut ModelHandle,
        frame: &Frame,
        threshold: f32,
    ) -> std::result::Result<DetectionSet, InferenceError> {
        let mut attempt = 0;
        loop {
            match detector.infer(frame, threshold) {
                Ok(detections) => return Ok(detections),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    debug!("frame #{} inference retry {}: {}", frame.index(), attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
