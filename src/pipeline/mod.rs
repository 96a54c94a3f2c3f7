//! Pipeline Coordinator
//!
//! One tokio task per scan session owns the [`ScanController`]. It samples
//! the frame source on a fixed tick, analyzes each frame inline and hands
//! triggered captures to a separate task; the CPU-bound extraction runs on
//! the blocking pool so sampling keeps its pace while an attempt is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::capture::FrameSource;
use crate::config::AppConfig;
use crate::error::{CaptureError, ConfigError, ExtractionError, RecognitionError, ScanFailure, StartError};
use crate::extraction::{ExtractionEngine, ExtractionResult};
use crate::scan::{CaptureTicket, EventBus, ScanController, ScanEvent, ScanOutcome, ScanSettings, ScanState};
use crate::vision::{analyze, AnalysisSettings, PreprocessingOptions};

/// Sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Frame sampling interval
    pub tick_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { tick_ms: 100 }
    }
}

impl PipelineSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::invalid("pipeline.tick_ms", "must be positive"));
        }
        Ok(())
    }
}

type ManualReply = oneshot::Sender<Result<ExtractionResult, ScanFailure>>;

enum Command {
    ManualScan(ManualReply),
}

/// Result of one capture attempt, tagged with the ticket it was started for
struct AttemptDone {
    ticket: CaptureTicket,
    result: Result<ExtractionResult, ScanFailure>,
}

/// Scan pipeline: configuration plus the shared extraction engine
pub struct ScanPipeline {
    engine: Arc<ExtractionEngine>,
    analysis: AnalysisSettings,
    scan: ScanSettings,
    preprocessing: PreprocessingOptions,
    settings: PipelineSettings,
    events: EventBus,
}

impl ScanPipeline {
    pub fn new(engine: Arc<ExtractionEngine>, config: &AppConfig) -> Self {
        Self::from_parts(
            engine,
            config.analysis.clone(),
            config.scan.clone(),
            config.preprocessing.clone(),
            config.pipeline.clone(),
        )
    }

    pub fn from_parts(
        engine: Arc<ExtractionEngine>,
        analysis: AnalysisSettings,
        scan: ScanSettings,
        preprocessing: PreprocessingOptions,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            engine,
            analysis,
            scan,
            preprocessing,
            settings,
            events: EventBus::new(),
        }
    }

    pub fn engine(&self) -> &Arc<ExtractionEngine> {
        &self.engine
    }

    /// Register an event listener. Listeners see events of every session
    /// started from this pipeline.
    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Start a scan session on `source`. Must be called from within a tokio
    /// runtime. `on_timeout` runs once if the auto-entry timeout elapses
    /// before a result is accepted.
    pub fn start<F>(&self, source: Arc<dyn FrameSource>, on_timeout: F) -> Result<SessionHandle, StartError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.analysis.validate()?;
        self.preprocessing.validate()?;
        self.scan.validate()?;
        self.settings.validate()?;

        let readiness = source.readiness();
        if !*readiness.borrow() {
            warn!("Refusing to start scan session: camera not ready");
            return Err(StartError::NotReady);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let session = SessionTask {
            id,
            controller: ScanController::new(self.scan.clone(), self.analysis.quality_threshold, self.events.clone()),
            source,
            engine: Arc::clone(&self.engine),
            analysis: self.analysis.clone(),
            preprocessing: self.preprocessing.clone(),
            tick: self.settings.tick(),
            cancel: cancel.clone(),
            readiness,
            commands: command_rx,
            done_tx,
            done_rx,
            pending_reply: None,
        };

        info!("Starting scan session {}", id);
        let task = tokio::spawn(session.run(Box::new(on_timeout)));

        Ok(SessionHandle {
            id,
            commands: command_tx,
            cancel,
            task,
        })
    }
}

/// Caller's handle on a running scan session.
///
/// Dropping the handle does not stop the session; call [`stop`](Self::stop).
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<ScanOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop sampling and cancel any in-flight attempt. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping scan session {}", self.id);
            self.cancel.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Capture now, regardless of position and cooldown. Resolves with this
    /// attempt's result; a rejected attempt still counts against the budget.
    pub async fn manual_scan(&self) -> Result<ExtractionResult, ScanFailure> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::ManualScan(reply_tx))
            .map_err(|_| ScanFailure::Inactive)?;
        reply_rx.await.unwrap_or(Err(ScanFailure::Inactive))
    }

    /// Wait for the session's terminal outcome
    pub async fn wait(self) -> ScanOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Scan session {} task failed: {}", self.id, e);
                ScanOutcome::Stopped
            }
        }
    }
}

struct SessionTask {
    id: Uuid,
    controller: ScanController,
    source: Arc<dyn FrameSource>,
    engine: Arc<ExtractionEngine>,
    analysis: AnalysisSettings,
    preprocessing: PreprocessingOptions,
    tick: Duration,
    cancel: CancellationToken,
    readiness: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<AttemptDone>,
    done_rx: mpsc::UnboundedReceiver<AttemptDone>,
    /// Manual scan waiting for the attempt with this id
    pending_reply: Option<(u64, ManualReply)>,
}

impl SessionTask {
    async fn run(mut self, on_timeout: Box<dyn FnOnce() + Send>) -> ScanOutcome {
        let started = Instant::now();
        self.controller.start(started);
        let deadline = started + self.controller.settings().auto_entry_timeout();

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let timeout = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(timeout);

        // Cleared when the lifecycle layer drops its sender; the last
        // reported value then stays in force
        let mut readiness_open = true;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break ScanOutcome::Stopped,

                changed = self.readiness.changed(), if readiness_open => {
                    if changed.is_err() {
                        debug!("Readiness channel closed for session {}", self.id);
                        readiness_open = false;
                    }
                    if !*self.readiness.borrow_and_update() {
                        warn!("Camera readiness revoked, ending session {}", self.id);
                        break ScanOutcome::PermissionRevoked;
                    }
                }

                Some(done) = self.done_rx.recv() => {
                    if let Some(outcome) = self.finish_attempt(done) {
                        break outcome;
                    }
                }

                Some(command) = self.commands.recv() => self.handle_command(command),

                _ = &mut timeout => {
                    // The timer may wake a hair before the std clock agrees
                    let now = Instant::now().max(deadline);
                    if let Some(outcome) = self.controller.check_timeout(now) {
                        break outcome;
                    }
                }

                _ = ticker.tick() => {
                    if let Some(ticket) = self.sample() {
                        self.spawn_attempt(ticket);
                    }
                }
            }
        };

        self.finish(&outcome);
        if matches!(outcome, ScanOutcome::TimedOut { .. }) {
            on_timeout();
        }
        outcome
    }

    /// Analyze the latest frame and feed it to the controller
    fn sample(&mut self) -> Option<CaptureTicket> {
        let Some(frame) = self.source.next_frame() else {
            trace!("No preview frame available");
            return None;
        };

        match analyze(&frame, &self.analysis) {
            Ok(result) => self.controller.observe(&result, Instant::now()),
            Err(e) => {
                warn!("Skipping frame: {}", e);
                None
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ManualScan(reply) => match self.controller.manual_scan(Instant::now()) {
                Ok(ticket) => {
                    self.pending_reply = Some((ticket.attempt, reply));
                    self.spawn_attempt(ticket);
                }
                Err(failure) => {
                    debug!("Manual scan refused: {}", failure);
                    let _ = reply.send(Err(failure));
                }
            },
        }
    }

    fn spawn_attempt(&self, ticket: CaptureTicket) {
        let source = Arc::clone(&self.source);
        let engine = Arc::clone(&self.engine);
        let options = self.preprocessing.clone();
        let cancel = self.cancel.child_token();
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            let result = run_attempt(source, engine, options, cancel).await;
            // The session may already be gone
            let _ = done_tx.send(AttemptDone { ticket, result });
        });
    }

    fn finish_attempt(&mut self, done: AttemptDone) -> Option<ScanOutcome> {
        let AttemptDone { ticket, result } = done;
        let reply_to = match self.pending_reply.take() {
            Some((attempt, reply)) if attempt == ticket.attempt => Some(reply),
            other => {
                self.pending_reply = other;
                None
            }
        };

        let extraction = result.as_ref().ok().cloned();
        let outcome = self.controller.complete(ticket, result.clone(), Instant::now());

        if let Some(reply) = reply_to {
            let answer = match (self.controller.state(), extraction) {
                (ScanState::Success, Some(extraction)) => Ok(extraction),
                _ => Err(result.err().unwrap_or_else(|| {
                    self.controller
                        .session()
                        .and_then(|s| s.last_failure().cloned())
                        .unwrap_or(ScanFailure::Cancelled)
                })),
            };
            let _ = reply.send(answer);
        }

        outcome
    }

    /// Tear down after the terminal outcome: cancel in-flight work and
    /// answer a manual scan still waiting.
    fn finish(&mut self, outcome: &ScanOutcome) {
        self.cancel.cancel();

        if let Some((_, reply)) = self.pending_reply.take() {
            let failure = match outcome {
                ScanOutcome::TimedOut { .. } => ScanFailure::TimedOut,
                ScanOutcome::PermissionRevoked => ScanFailure::PermissionRevoked,
                _ => ScanFailure::Cancelled,
            };
            let _ = reply.send(Err(failure));
        }

        if matches!(outcome, ScanOutcome::Stopped | ScanOutcome::PermissionRevoked) {
            self.controller.stop();
        }

        info!("Scan session {} ended: {}", self.id, outcome_label(outcome));
    }
}

fn outcome_label(outcome: &ScanOutcome) -> &'static str {
    match outcome {
        ScanOutcome::Success(_) => "success",
        ScanOutcome::Failed { .. } => "failed",
        ScanOutcome::TimedOut { .. } => "timed out",
        ScanOutcome::Stopped => "stopped",
        ScanOutcome::PermissionRevoked => "permission revoked",
    }
}

/// Capture a still and run extraction on the blocking pool
async fn run_attempt(
    source: Arc<dyn FrameSource>,
    engine: Arc<ExtractionEngine>,
    options: PreprocessingOptions,
    cancel: CancellationToken,
) -> Result<ExtractionResult, ScanFailure> {
    let image = tokio::select! {
        _ = cancel.cancelled() => return Err(ScanFailure::Cancelled),
        captured = source.capture_high_res() => captured?,
    };

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptureError::EmptyImage.into());
    }

    let extracted = tokio::task::spawn_blocking(move || engine.extract_cancellable(&image, &options, &cancel))
        .await
        .map_err(|e| ExtractionError::Recognition(RecognitionError::Backend(format!("extraction worker failed: {e}"))))?;

    Ok(extracted?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedImage, Frame, StillFrameSource};
    use crate::vision::analyzer::tests::striped_document_frame;
    use crate::vision::{FixedTextBackend, RecognitionBackend, RecognizedText};
    use async_trait::async_trait;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicU32, Ordering};

    const LICENSE_TEXT: &str = "DRIVER LICENSE ... First Name: JOHN Last Name: DOE DOB: 01/02/1990";

    fn document_source() -> Arc<StillFrameSource> {
        let preview = striped_document_frame(320, 240, 192, 96, 160, 120);
        Arc::new(StillFrameSource::with_preview(preview, high_res()))
    }

    fn empty_source() -> Arc<StillFrameSource> {
        let preview = Frame::luma(vec![128; 64 * 48], 64, 48);
        Arc::new(StillFrameSource::with_preview(preview, high_res()))
    }

    fn high_res() -> RgbaImage {
        RgbaImage::from_pixel(64, 40, Rgba([220, 220, 220, 255]))
    }

    /// Still source that counts preview frames and can hand out a readiness
    /// receiver whose sender is already gone
    struct TrackedSource {
        inner: Arc<StillFrameSource>,
        frames: AtomicU32,
        closed_readiness: bool,
    }

    impl TrackedSource {
        fn new(inner: Arc<StillFrameSource>, closed_readiness: bool) -> Arc<Self> {
            Arc::new(Self {
                inner,
                frames: AtomicU32::new(0),
                closed_readiness,
            })
        }

        fn frames(&self) -> u32 {
            self.frames.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FrameSource for TrackedSource {
        fn next_frame(&self) -> Option<Frame> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            self.inner.next_frame()
        }

        async fn capture_high_res(&self) -> Result<CapturedImage, CaptureError> {
            self.inner.capture_high_res().await
        }

        fn readiness(&self) -> watch::Receiver<bool> {
            if self.closed_readiness {
                watch::channel(true).1
            } else {
                self.inner.readiness()
            }
        }
    }

    /// Backend that blocks for a while before answering
    struct SlowBackend {
        delay: Duration,
        started: AtomicU32,
        finished: AtomicU32,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                started: AtomicU32::new(0),
                finished: AtomicU32::new(0),
            })
        }
    }

    impl RecognitionBackend for SlowBackend {
        fn recognize(&self, _: &DynamicImage) -> Result<RecognizedText, RecognitionError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(RecognizedText {
                text: LICENSE_TEXT.to_string(),
                confidence: 0.9,
            })
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn pipeline(text: &str, confidence: f64, scan: ScanSettings) -> ScanPipeline {
        pipeline_with(Arc::new(FixedTextBackend::new(text, confidence)), scan)
    }

    fn pipeline_with(backend: Arc<dyn RecognitionBackend>, scan: ScanSettings) -> ScanPipeline {
        let engine = ExtractionEngine::new(backend);
        let analysis = AnalysisSettings {
            quality_threshold: 0.3,
            ..AnalysisSettings::default()
        };
        ScanPipeline::from_parts(
            Arc::new(engine),
            analysis,
            scan,
            PreprocessingOptions::passthrough(),
            PipelineSettings { tick_ms: 10 },
        )
    }

    fn quick_scan(timeout_ms: u64) -> ScanSettings {
        ScanSettings {
            max_attempts: 3,
            cooldown_ms: 20,
            auto_entry_timeout_ms: timeout_ms,
            success_threshold: 0.3,
        }
    }

    fn timeout_counter() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let hook = Arc::clone(&count);
        (count, move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_refused_when_not_ready() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(5_000));
        let source = document_source();
        source.set_ready(false);

        let result = pipeline.start(source.clone(), || {});
        assert!(matches!(result, Err(StartError::NotReady)));
        assert_eq!(source.capture_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_positioned_document_is_captured() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(5_000));
        let events = pipeline.subscribe();
        let source = document_source();
        let (timeouts, on_timeout) = timeout_counter();

        let handle = pipeline.start(source.clone(), on_timeout).unwrap();
        let outcome = handle.wait().await;

        let ScanOutcome::Success(result) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(result.field(crate::extraction::FieldName::FirstName), Some("JOHN"));
        assert_eq!(source.capture_count(), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);

        let names: Vec<_> = events.try_iter().map(|e| e.name()).collect();
        assert_eq!(names.first(), Some(&"document_detected"));
        assert!(names.contains(&"positioned"));
        assert_eq!(names.last(), Some(&"scan_complete"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_low_confidence_fails_after_max_attempts() {
        let pipeline = pipeline("smudge", 0.0, quick_scan(10_000));
        let source = document_source();

        let handle = pipeline.start(source.clone(), || {}).unwrap();
        let outcome = handle.wait().await;

        assert!(matches!(
            outcome,
            ScanOutcome::Failed {
                attempts: 3,
                last_failure: ScanFailure::LowConfidence { .. }
            }
        ));
        assert_eq!(source.capture_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_fires_once() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(150));
        let (timeouts, on_timeout) = timeout_counter();
        let started = Instant::now();

        let handle = pipeline.start(empty_source(), on_timeout).unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome, ScanOutcome::TimedOut { attempts: 0 });
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(5_000));
        let events = pipeline.subscribe();
        let handle = pipeline.start(empty_source(), || {}).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        handle.stop();
        assert_eq!(handle.wait().await, ScanOutcome::Stopped);

        let _ = events.try_iter().count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readiness_revoked_ends_session() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(5_000));
        let source = empty_source();
        let handle = pipeline.start(source.clone(), || {}).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.set_ready(false);

        assert_eq!(handle.wait().await, ScanOutcome::PermissionRevoked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_scan_resolves_with_attempt_result() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(5_000));
        let source = empty_source();
        let handle = pipeline.start(source.clone(), || {}).unwrap();

        let result = handle.manual_scan().await.unwrap();
        assert_eq!(result.document_type, crate::extraction::DocumentType::DriversLicense);
        assert_eq!(source.capture_count(), 1);

        assert!(handle.wait().await.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejected_manual_scan_reports_reason() {
        let pipeline = pipeline("smudge", 0.0, quick_scan(5_000));
        let handle = pipeline.start(empty_source(), || {}).unwrap();

        let err = handle.manual_scan().await.unwrap_err();
        assert!(matches!(err, ScanFailure::LowConfidence { .. }));

        handle.stop();
        assert_eq!(handle.wait().await, ScanOutcome::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_rejects_invalid_analysis_settings() {
        let engine = ExtractionEngine::new(Arc::new(FixedTextBackend::new(LICENSE_TEXT, 0.9)));
        let analysis = AnalysisSettings {
            min_sharpness: 0.0,
            ..AnalysisSettings::default()
        };
        let pipeline = ScanPipeline::from_parts(
            Arc::new(engine),
            analysis,
            quick_scan(5_000),
            PreprocessingOptions::passthrough(),
            PipelineSettings { tick_ms: 10 },
        );

        let result = pipeline.start(document_source(), || {});
        assert!(matches!(result, Err(StartError::Config(ConfigError::Invalid { .. }))));

        let preprocessing = PreprocessingOptions {
            contrast: 0.0,
            ..PreprocessingOptions::default()
        };
        let pipeline = ScanPipeline::from_parts(
            Arc::new(ExtractionEngine::new(Arc::new(FixedTextBackend::new(LICENSE_TEXT, 0.9)))),
            AnalysisSettings::default(),
            quick_scan(5_000),
            preprocessing,
            PipelineSettings { tick_ms: 10 },
        );
        assert!(matches!(
            pipeline.start(document_source(), || {}),
            Err(StartError::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_readiness_channel_keeps_last_value() {
        let pipeline = pipeline(LICENSE_TEXT, 0.9, quick_scan(150));
        let source = TrackedSource::new(empty_source(), true);
        let (timeouts, on_timeout) = timeout_counter();

        let handle = pipeline.start(source.clone(), on_timeout).unwrap();

        assert_eq!(handle.wait().await, ScanOutcome::TimedOut { attempts: 0 });
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(source.frames() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_in_flight_extraction() {
        let backend = SlowBackend::new(Duration::from_millis(300));
        let pipeline = pipeline_with(backend.clone(), quick_scan(5_000));
        let events = pipeline.subscribe();
        let still = document_source();
        let handle = pipeline.start(still.clone(), || {}).unwrap();

        wait_until(|| backend.started.load(Ordering::SeqCst) == 1).await;
        handle.stop();
        assert_eq!(handle.wait().await, ScanOutcome::Stopped);

        // Let the blocked recognition finish; its result must go nowhere
        wait_until(|| backend.finished.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(events.try_iter().all(|e| !matches!(e, ScanEvent::ScanComplete(_))));
        assert_eq!(still.capture_count(), 1);
        assert_eq!(backend.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sampling_continues_during_extraction() {
        let backend = SlowBackend::new(Duration::from_millis(500));
        let pipeline = pipeline_with(backend.clone(), quick_scan(5_000));
        let source = TrackedSource::new(document_source(), false);
        let handle = pipeline.start(source.clone(), || {}).unwrap();

        wait_until(|| backend.started.load(Ordering::SeqCst) == 1).await;
        let before = source.frames();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.finished.load(Ordering::SeqCst), 0);
        assert!(source.frames() >= before + 3, "{} -> {}", before, source.frames());

        handle.stop();
        assert_eq!(handle.wait().await, ScanOutcome::Stopped);
    }
}
