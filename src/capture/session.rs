use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use concurrent_queue::ConcurrentQueue;
use futures_core::Stream;
use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{image::PixelBuffer, utils::lock};

use super::{
    backend::BackendEvent,
    capture::{BackendError, CaptureError, CaptureSettings},
    detector::DetectorRegistry,
    types::{
        CaptureMode, CapturePlan, CaptureReport, CaptureRequest, DetectorId, PartialFramePolicy,
        SessionState,
    },
};

pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub partial_frame_policy: PartialFramePolicy,
    /// How many of the newest frames a stream capture keeps.
    pub stream_buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            partial_frame_policy: PartialFramePolicy::default(),
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SessionOutcome {
    Completed {
        frames: Vec<Arc<PixelBuffer>>,
        report: Option<CaptureReport>,
    },
    /// `frames` holds what was captured before the cancel request.
    Cancelled {
        frames: Vec<Arc<PixelBuffer>>,
        report: Option<CaptureReport>,
    },
    Failed {
        error: CaptureError,
        report: Option<CaptureReport>,
    },
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed { .. } => SessionState::Completed,
            SessionOutcome::Cancelled { .. } => SessionState::Cancelled,
            SessionOutcome::Failed { .. } => SessionState::Failed,
        }
    }

    pub fn frames(&self) -> &[Arc<PixelBuffer>] {
        match self {
            SessionOutcome::Completed { frames, .. } | SessionOutcome::Cancelled { frames, .. } => {
                frames
            }
            SessionOutcome::Failed { .. } => &[],
        }
    }

    pub fn report(&self) -> Option<&CaptureReport> {
        match self {
            SessionOutcome::Completed { report, .. }
            | SessionOutcome::Cancelled { report, .. }
            | SessionOutcome::Failed { report, .. } => report.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&CaptureError> {
        match self {
            SessionOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Progress(CaptureReport),
    /// Always the last event of a session.
    Terminal(SessionOutcome),
}

/// Progress of one session, in order, ending with a [`SessionEvent::Terminal`].
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct SessionInner {
    state: SessionState,
    history: Vec<SessionState>,
    /// Streams only keep the newest reports, like their frames.
    reports: VecDeque<CaptureReport>,
    report_limit: Option<usize>,
    outcome: Option<SessionOutcome>,
}

struct Shared {
    detector_id: DetectorId,
    registry: Arc<DetectorRegistry>,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_taken: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn transition(&self, inner: &mut SessionInner, next: SessionState) -> bool {
        if !inner.state.can_transition_to(next) {
            error!(
                "Ignoring invalid session transition {:?} -> {next:?} on detector {}",
                inner.state, self.detector_id
            );
            return false;
        }
        debug!("Session on {}: {:?} -> {next:?}", self.detector_id, inner.state);
        inner.state = next;
        inner.history.push(next);
        self.state_tx.send_replace(next);
        true
    }

    /// Frames or an explicit acknowledgement both move a requested session on.
    fn mark_running(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Requested {
            self.transition(&mut inner, SessionState::Running);
        }
    }

    fn publish_report(&self, report: CaptureReport) {
        debug!("{} ({})", report.message, self.detector_id);
        {
            let mut inner = lock(&self.inner);
            inner.reports.push_back(report.clone());
            if let Some(limit) = inner.report_limit {
                while inner.reports.len() > limit {
                    inner.reports.pop_front();
                }
            }
        }
        self.registry.record_report(self.detector_id, report.clone());
        // Progress nobody can read is not buffered.
        if self.events_taken.load(Ordering::Acquire) {
            let _ = self.events_tx.send(SessionEvent::Progress(report));
        }
    }

    fn finish(&self, outcome: SessionOutcome) {
        // Free the detector before anyone can observe the terminal state.
        self.registry.release(self.detector_id);

        {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                warn!("Session on {} already finished", self.detector_id);
                return;
            }
            let next = outcome.state();
            if next == SessionState::Completed && inner.state == SessionState::Requested {
                self.transition(&mut inner, SessionState::Running);
            }
            inner.outcome = Some(outcome.clone());
            self.transition(&mut inner, next);
        }

        match &outcome {
            SessionOutcome::Failed { error, .. } => {
                error!("Capture on {} failed: {error}", self.detector_id)
            }
            other => info!(
                "Capture on {} ended as {:?} with {} frame(s)",
                self.detector_id,
                other.state(),
                other.frames().len()
            ),
        }
        let _ = self.events_tx.send(SessionEvent::Terminal(outcome));
    }
}

/// Frames accumulated by a running capture. Streams only keep the newest ones.
enum FrameStore {
    All(Vec<Arc<PixelBuffer>>),
    Latest(ConcurrentQueue<Arc<PixelBuffer>>),
}

impl FrameStore {
    fn for_mode(mode: &CaptureMode, stream_buffer_size: usize) -> Self {
        match mode {
            CaptureMode::Sequence(_) => FrameStore::All(Vec::new()),
            CaptureMode::Stream(_) => {
                FrameStore::Latest(ConcurrentQueue::bounded(stream_buffer_size.max(1)))
            }
        }
    }

    fn push(&mut self, frame: Arc<PixelBuffer>) {
        match self {
            FrameStore::All(frames) => frames.push(frame),
            FrameStore::Latest(queue) => {
                if let Ok(Some(_)) = queue.force_push(frame) {
                    debug!("Live buffer full, dropped the oldest frame");
                }
            }
        }
    }

    fn into_frames(self) -> Vec<Arc<PixelBuffer>> {
        match self {
            FrameStore::All(frames) => frames,
            FrameStore::Latest(queue) => queue.try_iter().collect(),
        }
    }
}

/// One capture against one detector, from request to a single terminal outcome.
///
/// A session is used once. The detector is claimed for the whole capture and
/// released before the terminal state becomes visible.
pub struct CaptureSession {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl CaptureSession {
    pub fn new(registry: Arc<DetectorRegistry>, detector_id: DetectorId, options: SessionOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Self {
            shared: Arc::new(Shared {
                detector_id,
                registry,
                options,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Idle,
                    history: vec![SessionState::Idle],
                    reports: VecDeque::new(),
                    report_limit: None,
                    outcome: None,
                }),
                state_tx,
                events_tx,
                events_taken: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            events: Mutex::new(Some(events_rx)),
        }
    }

    pub fn detector_id(&self) -> DetectorId {
        self.shared.detector_id
    }

    /// Requests the capture and returns once the backend has acknowledged it.
    ///
    /// Settings are checked before the detector is claimed or the backend is contacted.
    pub async fn start(&self, settings: CaptureSettings, mode: CaptureMode) -> Result<(), CaptureError> {
        let shared = &self.shared;
        let id = shared.detector_id;

        {
            let mut inner = lock(&shared.inner);
            if inner.state != SessionState::Idle {
                return Err(CaptureError::InvalidState {
                    state: inner.state,
                    operation: "start",
                });
            }

            mode.validate()?;
            settings.validate()?;
            let detector = shared
                .registry
                .get(id)
                .ok_or(CaptureError::DetectorNotFound(id))?;
            settings.validate_for(&detector.specification)?;

            shared.registry.claim(id)?;
            inner.report_limit = match &mode {
                CaptureMode::Stream(_) => Some(shared.options.stream_buffer_size.max(1)),
                CaptureMode::Sequence(_) => None,
            };
            shared.transition(&mut inner, SessionState::Requested);
        }

        info!("Starting {} on detector {id}", mode.describe());
        let request = CaptureRequest {
            detector_id: id,
            mode: mode.clone(),
            settings: settings.clone(),
        };

        let events = match shared.registry.backend().run_capture(request).await {
            Ok(events) => events,
            Err(err) => {
                shared.finish(SessionOutcome::Failed {
                    error: err.clone().into(),
                    report: None,
                });
                return Err(err.into());
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(shared.clone(), events, settings, mode, ack_tx));
        tokio::spawn(supervise(shared.clone(), driver));

        match ack_rx.await {
            Ok(result) => result,
            // The driver died before answering; the supervisor records why.
            Err(_) => match self.wait().await?.error() {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
        }
    }

    /// Submits a cancel request and returns without waiting for the backend.
    pub fn cancel(&self) -> Result<(), CaptureError> {
        let inner = lock(&self.shared.inner);
        if !inner.state.is_active() {
            return Err(CaptureError::InvalidState {
                state: inner.state,
                operation: "cancel",
            });
        }
        if !self.shared.cancel.is_cancelled() {
            info!("Cancel requested for detector {}", self.shared.detector_id);
            self.shared.cancel.cancel();
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.inner).state
    }

    pub fn state_history(&self) -> Vec<SessionState> {
        lock(&self.shared.inner).history.clone()
    }

    /// Reports in step order. Streams keep only the newest `stream_buffer_size`.
    pub fn reports(&self) -> Vec<CaptureReport> {
        lock(&self.shared.inner).reports.iter().cloned().collect()
    }

    pub fn last_report(&self) -> Option<CaptureReport> {
        lock(&self.shared.inner).reports.back().cloned()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        lock(&self.shared.inner).outcome.clone()
    }

    /// The event channel. Can be taken once; later calls return `None`.
    ///
    /// Progress is only sent once the channel has been taken. The terminal
    /// event is always delivered.
    pub fn events(&self) -> Option<SessionEvents> {
        let rx = lock(&self.events).take()?;
        self.shared.events_taken.store(true, Ordering::Release);
        Some(SessionEvents { rx })
    }

    pub async fn wait(&self) -> Result<SessionOutcome, CaptureError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let state = *state_rx.borrow();
        if state == SessionState::Idle {
            return Err(CaptureError::InvalidState {
                state,
                operation: "wait on",
            });
        }

        // The sender lives as long as `self`, so this only returns once terminal.
        let _ = state_rx.wait_for(|state| state.is_terminal()).await.map(|_| ());

        self.outcome().ok_or(CaptureError::InvalidState {
            state: self.state(),
            operation: "wait on",
        })
    }
}

/// Fails the session if the driver task dies without reaching a terminal state.
async fn supervise(shared: Arc<Shared>, driver: JoinHandle<()>) {
    let Err(err) = driver.await else {
        return;
    };
    let id = shared.detector_id;
    error!("Capture task for detector {id} stopped unexpectedly: {err}");

    if let Err(err) = shared.registry.backend().cancel_capture(id).await {
        warn!("Failed to cancel capture on {id}: {err}");
    }
    let report = lock(&shared.inner).reports.back().cloned();
    shared.finish(SessionOutcome::Failed {
        error: BackendError::new("capture", format!("capture task stopped: {err}")).into(),
        report,
    });
}

fn acknowledge(ack: &mut Option<oneshot::Sender<Result<(), CaptureError>>>) {
    if let Some(tx) = ack.take() {
        let _ = tx.send(Ok(()));
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<BackendEvent>,
    settings: CaptureSettings,
    mode: CaptureMode,
    ack: oneshot::Sender<Result<(), CaptureError>>,
) {
    let id = shared.detector_id;
    let backend = shared.registry.backend().clone();
    let mut ack = Some(ack);
    let mut frames = FrameStore::for_mode(&mode, shared.options.stream_buffer_size);
    let mut received: u32 = 0;
    // Set once the cancel request is seen: how many frames the result may hold.
    let mut accept_limit: Option<u32> = None;
    let mut last_report: Option<CaptureReport> = None;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled(), if accept_limit.is_none() => {
                accept_limit = Some(match shared.options.partial_frame_policy {
                    PartialFramePolicy::ExcludeInFlight => received,
                    PartialFramePolicy::IncludeInFlight => received + 1,
                });
                info!("Stopping capture on {id} after {received} frame(s)");
                if let Err(err) = backend.cancel_capture(id).await {
                    warn!("Failed to cancel capture on {id}: {err}");
                }
                continue;
            }
            next = timeout(settings.timeout, events.recv()) => next,
        };

        match next {
            Err(_) => {
                warn!("No event from detector {id} within {:?}", settings.timeout);
                if let Err(err) = backend.cancel_capture(id).await {
                    warn!("Failed to cancel timed out capture on {id}: {err}");
                }
                break SessionOutcome::Failed {
                    error: CaptureError::Timeout(settings.timeout),
                    report: last_report,
                };
            }
            Ok(None) if accept_limit.is_some() => {
                break SessionOutcome::Cancelled {
                    frames: frames.into_frames(),
                    report: last_report,
                };
            }
            Ok(None) => {
                break SessionOutcome::Failed {
                    error: BackendError::new("capture", "event channel closed before the capture ended")
                        .into(),
                    report: last_report,
                };
            }
            Ok(Some(BackendEvent::Acknowledged)) => {
                shared.mark_running();
                acknowledge(&mut ack);
            }
            Ok(Some(BackendEvent::Frame { index, buffer })) => {
                if accept_limit.is_some_and(|limit| received >= limit) {
                    debug!("Dropping frame {index} from {id} delivered after cancel");
                    continue;
                }
                shared.mark_running();
                acknowledge(&mut ack);

                received += 1;
                frames.push(Arc::new(buffer));
                let report = CaptureReport::for_frame(&mode, received);
                shared.publish_report(report.clone());
                last_report = Some(report);
            }
            Ok(Some(BackendEvent::Finished)) if accept_limit.is_some() => {
                break SessionOutcome::Cancelled {
                    frames: frames.into_frames(),
                    report: last_report,
                };
            }
            Ok(Some(BackendEvent::Finished)) => match mode.total_steps() {
                Some(total) if received < total => {
                    break SessionOutcome::Failed {
                        error: BackendError::new(
                            "capture",
                            format!("finished after {received} of {total} frames"),
                        )
                        .into(),
                        report: last_report,
                    };
                }
                _ => {
                    break SessionOutcome::Completed {
                        frames: frames.into_frames(),
                        report: last_report,
                    };
                }
            },
            Ok(Some(BackendEvent::Stopped)) if accept_limit.is_some() => {
                break SessionOutcome::Cancelled {
                    frames: frames.into_frames(),
                    report: last_report,
                };
            }
            Ok(Some(BackendEvent::Stopped)) => {
                break SessionOutcome::Failed {
                    error: BackendError::new("capture", "stopped without a cancel request").into(),
                    report: last_report,
                };
            }
            Ok(Some(BackendEvent::Failed(err))) => {
                break SessionOutcome::Failed {
                    error: err.into(),
                    report: last_report,
                };
            }
        }
    };

    if let Some(tx) = ack.take() {
        let result = match outcome.error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        let _ = tx.send(result);
    }
    shared.finish(outcome);
}
