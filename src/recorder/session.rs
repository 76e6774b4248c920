//! Per-source recording session
//!
//! ```text
//!            trigger                attach ok               stop timer
//!   IDLE ───────────> STARTING ───────────────> RECORDING ─────────────> FINISHING
//!    ^                   │  attach failed /                                  │
//!    │                   │  stop before attach                               │
//!    ├───────────────────┘                                                   │
//!    └──────────────────────────── EOS observed, sub-graph disposed ─────────┘
//! ```
//!
//! The session is a consumer of its source flow point. Every sample lands in
//! the lookback buffer; while RECORDING it is also forwarded to the clip
//! sub-graph. State, sub-graph reference and timer live under one lock.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::lookback::LookbackBuffer;
use crate::config::RecorderConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::graph::{
    AttachHandle, FlowPoint, GraphMutator, Sample, SampleConsumer, SpliceMode, StageSpec,
    SubGraphSpec, TransientSubGraph,
};
use crate::utils::{replace_delay, CancellableDelay};

/// Recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Starting,
    Recording,
    Finishing,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Starting => "starting",
            RecordingState::Recording => "recording",
            RecordingState::Finishing => "finishing",
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved per-session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub fps: u32,
    /// Lookback window; the stop timer runs for twice this long
    pub window: Duration,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub extension: String,
    /// Bound on waiting for an in-flight start or finish to settle
    pub wait_start: Duration,
    /// Pause between a settle and the re-evaluation of the trigger
    pub retry_tick: Duration,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl From<&RecorderConfig> for SessionSettings {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            fps: config.fps,
            window: Duration::from_secs(config.window_secs as u64),
            output_dir: PathBuf::from(&config.output_dir),
            file_prefix: config.file_prefix.clone(),
            extension: config.extension.clone(),
            wait_start: Duration::from_millis(config.wait_start_ms),
            retry_tick: Duration::from_millis(config.retry_tick_ms),
            max_retries: config.max_retries,
            queue_capacity: config.queue_capacity,
        }
    }
}

impl SessionSettings {
    fn stop_after(&self) -> Duration {
        self.window * 2
    }
}

/// Snapshot of a session for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub source_id: String,
    pub state: RecordingState,
    pub current_path: Option<String>,
    pub last_clip: Option<String>,
    pub clips_completed: u64,
    pub buffered: usize,
    pub last_failure: Option<String>,
}

struct SessionInner {
    state: RecordingState,
    sub_graph: Option<Arc<dyn TransientSubGraph>>,
    sub_input: Option<Arc<dyn SampleConsumer>>,
    sequence: u64,
    stop_timer: Option<CancellableDelay>,
    /// Bumped on every arm; a timer callback from an older arm is stale
    timer_epoch: u64,
    output_path: Option<PathBuf>,
    attach: Option<AttachHandle>,
    /// Stop arrived while the attach probe was executing
    stop_requested: bool,
    last_clip: Option<PathBuf>,
    clips_completed: u64,
    last_failure: Option<String>,
}

/// Clip recorder for one source
pub struct RecordingSession {
    source_id: String,
    consumer_name: String,
    point: Arc<FlowPoint>,
    mutator: GraphMutator,
    events: Arc<EventBus>,
    settings: SessionSettings,
    buffer: Mutex<LookbackBuffer<Sample>>,
    inner: Mutex<SessionInner>,
    settled: Condvar,
    weak_self: Weak<RecordingSession>,
}

impl RecordingSession {
    pub fn new(
        source_id: impl Into<String>,
        point: Arc<FlowPoint>,
        mutator: GraphMutator,
        events: Arc<EventBus>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let source_id = source_id.into();
        let buffer = LookbackBuffer::for_window(settings.fps, settings.window);
        Arc::new_cyclic(|weak_self| Self {
            consumer_name: format!("recorder:{}", source_id),
            source_id,
            point,
            mutator,
            events,
            settings,
            buffer: Mutex::new(buffer),
            inner: Mutex::new(SessionInner {
                state: RecordingState::Idle,
                sub_graph: None,
                sub_input: None,
                sequence: 0,
                stop_timer: None,
                timer_epoch: 0,
                output_path: None,
                attach: None,
                stop_requested: false,
                last_clip: None,
                clips_completed: 0,
                last_failure: None,
            }),
            settled: Condvar::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Link the session to its source flow point so samples start filling
    /// the lookback buffer
    pub fn install(self: &Arc<Self>) -> Result<()> {
        self.point.link(self.clone())?;
        debug!(
            "Recorder for '{}' installed on '{}' (lookback {} samples)",
            self.source_id,
            self.point.name(),
            self.lookback_capacity()
        );
        Ok(())
    }

    pub fn uninstall(&self) {
        self.point.unlink(&self.consumer_name);
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    /// Samples held for the start of the next clip
    pub fn lookback_capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            source_id: self.source_id.clone(),
            state: inner.state,
            current_path: inner.output_path.as_ref().map(|p| p.display().to_string()),
            last_clip: inner.last_clip.as_ref().map(|p| p.display().to_string()),
            clips_completed: inner.clips_completed,
            buffered: self.buffer.lock().len(),
            last_failure: inner.last_failure.clone(),
        }
    }

    /// Start a clip or extend the running one, returning the clip path
    ///
    /// Blocks only when a start or finish is in flight.
    pub fn trigger(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        let mut waits = 0u32;
        loop {
            let state = inner.state;
            match state {
                RecordingState::Idle => return self.start(&mut inner),
                RecordingState::Recording => {
                    self.arm_stop_timer(&mut inner);
                    info!("Recording '{}' already running, stop timer re-armed", self.source_id);
                    return self.current_path(&inner);
                }
                in_flight => {
                    if waits >= self.settings.max_retries.max(1) {
                        return Err(AppError::Conflict(format!(
                            "source '{}' still {} after {} retries",
                            self.source_id, in_flight, waits
                        )));
                    }
                    waits += 1;
                    debug!(
                        "Recording '{}' is {}, waiting for it to settle",
                        self.source_id, in_flight
                    );
                    let deadline = Instant::now() + self.settings.wait_start;
                    while inner.state == in_flight {
                        if self.settled.wait_until(&mut inner, deadline).timed_out()
                            && inner.state == in_flight
                        {
                            return Err(AppError::Timeout(format!(
                                "source '{}' did not leave {} within {:?}",
                                self.source_id, in_flight, self.settings.wait_start
                            )));
                        }
                    }
                    if !self.settings.retry_tick.is_zero() {
                        let tick = self.settings.retry_tick;
                        MutexGuard::unlocked(&mut inner, || thread::sleep(tick));
                    }
                }
            }
        }
    }

    /// Stop the running clip now instead of waiting for the timer
    pub fn finish_now(&self) {
        let epoch = self.inner.lock().timer_epoch;
        self.on_stop_timer(epoch);
    }

    fn current_path(&self, inner: &SessionInner) -> Result<PathBuf> {
        inner
            .output_path
            .clone()
            .ok_or_else(|| AppError::Internal(format!("source '{}' has no clip path", self.source_id)))
    }

    fn clip_path(&self, sequence: u64) -> PathBuf {
        self.settings.output_dir.join(format!(
            "{}{}_{}.{}",
            self.settings.file_prefix, self.source_id, sequence, self.settings.extension
        ))
    }

    /// IDLE → STARTING
    fn start(&self, inner: &mut SessionInner) -> Result<PathBuf> {
        let sequence = inner.sequence;
        inner.sequence += 1;
        let path = self.clip_path(sequence);

        inner.state = RecordingState::Starting;
        inner.output_path = Some(path.clone());
        inner.stop_requested = false;
        self.publish_state(inner);

        let name = format!("recording_{}_{}", self.source_id, sequence);
        let location = path.clone();
        let capacity = self
            .settings
            .queue_capacity
            .max(self.lookback_capacity() + self.settings.fps as usize);
        let weak = self.weak_self.clone();

        let handle = self.mutator.attach(
            &self.point,
            SpliceMode::Owned,
            move |_, caps| {
                let sub = SubGraphSpec::new(name)
                    .caps(caps)
                    .stage(StageSpec::Queue { capacity })
                    .stage(StageSpec::FileSink { location })
                    .build()?;
                Ok(sub as Arc<dyn TransientSubGraph>)
            },
            move |result| {
                if let Some(session) = weak.upgrade() {
                    session.on_attached(result);
                }
            },
        );
        inner.attach = Some(handle);
        self.arm_stop_timer(inner);

        info!("Recording '{}' starting -> {}", self.source_id, path.display());
        Ok(path)
    }

    fn arm_stop_timer(&self, inner: &mut SessionInner) {
        inner.timer_epoch += 1;
        let epoch = inner.timer_epoch;
        let weak = self.weak_self.clone();
        let timer = self.mutator.scheduler().schedule(
            format!("stop:{}", self.source_id),
            self.settings.stop_after(),
            move || {
                if let Some(session) = weak.upgrade() {
                    session.on_stop_timer(epoch);
                }
            },
        );
        replace_delay(&mut inner.stop_timer, Some(timer));
    }

    /// Attach callback; runs on the data-flow thread before the triggering
    /// sample reaches this session's `on_sample`
    fn on_attached(&self, result: Result<Arc<dyn TransientSubGraph>>) {
        let mut inner = self.inner.lock();
        inner.attach = None;

        let sub = match result {
            Ok(sub) => sub,
            Err(e) => {
                error!("Recording '{}' failed to start: {}", self.source_id, e);
                replace_delay(&mut inner.stop_timer, None);
                inner.state = RecordingState::Idle;
                inner.output_path = None;
                inner.stop_requested = false;
                inner.last_failure = Some(e.to_string());
                self.events.publish(SystemEvent::RecordingFailed {
                    source_id: self.source_id.clone(),
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                });
                self.publish_state(&inner);
                self.settled.notify_all();
                return;
            }
        };

        let input = sub.input();
        let drained = {
            let mut buffer = self.buffer.lock();
            let mut drained = 0usize;
            for _ in 0..buffer.len() {
                match buffer.pop_oldest() {
                    Ok(sample) => match input.on_sample(&sample) {
                        Ok(()) => drained += 1,
                        Err(e) => debug!("Lookback sample {} not accepted: {}", sample.sequence, e),
                    },
                    Err(e) => debug!("Skipping lookback sample: {}", e),
                }
            }
            drained
        };

        inner.sub_graph = Some(sub);
        inner.sub_input = Some(input);
        inner.state = RecordingState::Recording;
        inner.last_failure = None;
        info!(
            "Recording '{}' started with {} lookback samples",
            self.source_id, drained
        );
        self.publish_state(&inner);
        self.settled.notify_all();

        if inner.stop_requested {
            inner.stop_requested = false;
            let epoch = inner.timer_epoch;
            let weak = self.weak_self.clone();
            // Not on the data-flow thread
            self.mutator
                .scheduler()
                .defer(format!("stop:{}", self.source_id), move || {
                    if let Some(session) = weak.upgrade() {
                        session.on_stop_timer(epoch);
                    }
                });
        }
    }

    /// Stop for the timer armed at `epoch`; ignored once the timer was re-armed
    fn on_stop_timer(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if epoch != inner.timer_epoch {
            debug!(
                "Stale stop timer for '{}' ignored (epoch {} < {})",
                self.source_id, epoch, inner.timer_epoch
            );
            return;
        }
        let state = inner.state;
        match state {
            RecordingState::Recording => self.finish(inner),
            RecordingState::Starting => {
                let withdrawn = inner.attach.as_ref().map(|h| h.withdraw()).unwrap_or(false);
                if withdrawn {
                    info!("Recording '{}' stopped before attach", self.source_id);
                    inner.attach = None;
                    replace_delay(&mut inner.stop_timer, None);
                    inner.state = RecordingState::Idle;
                    inner.output_path = None;
                    self.publish_state(&inner);
                    self.settled.notify_all();
                } else {
                    debug!("Recording '{}' attach in progress, stop deferred", self.source_id);
                    inner.stop_requested = true;
                }
            }
            RecordingState::Idle | RecordingState::Finishing => {
                debug!("Stop for '{}' ignored in {}", self.source_id, state);
            }
        }
    }

    /// RECORDING → FINISHING; detach runs after the lock is released
    fn finish(&self, mut inner: MutexGuard<'_, SessionInner>) {
        let Some(sub) = inner.sub_graph.clone() else {
            warn!("Recording '{}' has no sub-graph to finish", self.source_id);
            return;
        };
        inner.state = RecordingState::Finishing;
        inner.sub_input = None;
        replace_delay(&mut inner.stop_timer, None);
        self.publish_state(&inner);
        drop(inner);

        info!("Recording '{}' finishing", self.source_id);
        let weak = self.weak_self.clone();
        let result = self.mutator.detach(sub, None, move |result| {
            if let Some(session) = weak.upgrade() {
                session.on_disposed(result);
            }
        });
        if let Err(e) = result {
            warn!("Recording '{}' detach: {}", self.source_id, e);
        }
    }

    /// FINISHING → IDLE; runs on a scheduler thread
    fn on_disposed(&self, result: Result<()>) {
        let mut inner = self.inner.lock();
        inner.sub_graph = None;
        inner.sub_input = None;
        inner.state = RecordingState::Idle;
        let path = inner.output_path.take();

        match (&result, &path) {
            (Ok(()), Some(path)) => {
                inner.clips_completed += 1;
                inner.last_clip = Some(path.clone());
                info!("Recording '{}' complete: {}", self.source_id, path.display());
                self.events.publish(SystemEvent::ClipCompleted {
                    source_id: self.source_id.clone(),
                    path: path.display().to_string(),
                    completed_at: Utc::now(),
                });
            }
            (Err(e), _) => {
                warn!("Recording '{}' disposed with error: {}", self.source_id, e);
                inner.last_failure = Some(e.to_string());
                self.events.publish(SystemEvent::RecordingFailed {
                    source_id: self.source_id.clone(),
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                });
            }
            (Ok(()), None) => {}
        }
        self.publish_state(&inner);
        self.settled.notify_all();
    }

    fn publish_state(&self, inner: &SessionInner) {
        self.events.publish(SystemEvent::RecordingStateChanged {
            source_id: self.source_id.clone(),
            state: inner.state.as_str().to_string(),
            path: inner.output_path.as_ref().map(|p| p.display().to_string()),
        });
    }
}

impl SampleConsumer for RecordingSession {
    fn name(&self) -> &str {
        &self.consumer_name
    }

    fn on_sample(&self, sample: &Sample) -> Result<()> {
        let input = {
            let inner = self.inner.lock();
            self.buffer.lock().push(sample.clone());
            match inner.state {
                RecordingState::Recording => inner.sub_input.clone(),
                _ => None,
            }
        };
        match input {
            Some(input) => input.on_sample(sample),
            None => Ok(()),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        replace_delay(&mut inner.stop_timer, None);
        if let Some(handle) = inner.attach.take() {
            handle.withdraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Caps, LiveGraph, RunState};
    use crate::utils::Scheduler;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        graph: Arc<LiveGraph>,
        point: Arc<FlowPoint>,
        session: Arc<RecordingSession>,
        events: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    fn settings(dir: &std::path::Path, window: Duration) -> SessionSettings {
        SessionSettings {
            fps: 50,
            window,
            output_dir: dir.to_path_buf(),
            file_prefix: "event_".to_string(),
            extension: "mjpeg".to_string(),
            wait_start: Duration::from_secs(2),
            retry_tick: Duration::from_millis(1),
            max_retries: 1,
            queue_capacity: 256,
        }
    }

    fn harness(window: Duration) -> Harness {
        harness_with(window, |_| {})
    }

    fn harness_with(window: Duration, adjust: impl FnOnce(&mut SessionSettings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let graph = LiveGraph::new("main");
        let point = graph.add_flow_point("appsink_0");
        point.set_caps(Caps::new("image/jpeg", 320, 240, 50));
        graph.set_state(RunState::Playing).unwrap();

        let events = Arc::new(EventBus::new());
        let mutator = GraphMutator::new(graph.clone(), Scheduler::current());
        let mut s = settings(dir.path(), window);
        adjust(&mut s);
        let session = RecordingSession::new("0", point.clone(), mutator, events.clone(), s);
        session.install().unwrap();
        Harness {
            graph,
            point,
            session,
            events,
            _dir: dir,
        }
    }

    /// Push one 1-byte sample every 20ms until the returned flag is cleared
    fn feed(point: Arc<FlowPoint>) -> Arc<AtomicBool> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        thread::spawn(move || {
            let mut seq = 0u64;
            while r.load(Ordering::SeqCst) {
                point.push(Sample::new(
                    vec![(seq % 256) as u8],
                    Duration::from_millis(seq * 20),
                    Duration::from_millis(20),
                    seq,
                ));
                seq += 1;
                thread::sleep(Duration::from_millis(20));
            }
        });
        running
    }

    async fn wait_for(session: &RecordingSession, state: RecordingState, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if session.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.state() == state
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clip_lifecycle_and_naming() {
        let h = harness(Duration::from_millis(100));
        let mut rx = h.events.subscribe();
        let running = feed(h.point.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let session = h.session.clone();
        let path = tokio::task::spawn_blocking(move || session.trigger())
            .await
            .unwrap()
            .unwrap();
        assert!(path.ends_with("event_0_0.mjpeg"));
        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);
        assert_eq!(h.graph.sub_graph_count(), 1);

        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(2)).await);
        running.store(false, Ordering::SeqCst);
        assert_eq!(h.graph.sub_graph_count(), 0);

        let status = h.session.status();
        assert_eq!(status.clips_completed, 1);
        assert_eq!(status.last_clip.as_deref(), Some(path.to_str().unwrap()));
        // Lookback plus live samples
        assert!(std::fs::metadata(&path).unwrap().len() >= 5);

        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            if let SystemEvent::ClipCompleted { path: p, .. } = event {
                assert_eq!(p, path.display().to_string());
                completed = true;
            }
        }
        assert!(completed);

        // Sequence advances for the next clip
        let session = h.session.clone();
        let next = tokio::task::spawn_blocking(move || session.trigger())
            .await
            .unwrap()
            .unwrap();
        assert!(next.ends_with("event_0_1.mjpeg"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retrigger_while_recording_debounces() {
        let h = harness(Duration::from_millis(150));
        let running = feed(h.point.clone());

        let s = h.session.clone();
        let first = tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);

        // Stop was due at 300ms; re-arm at 150ms moves it to 450ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        let s = h.session.clone();
        let second = tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_millis(220)).await;
        assert_eq!(h.session.state(), RecordingState::Recording);
        assert_eq!(h.graph.sub_graph_count(), 1);

        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(2)).await);
        running.store(false, Ordering::SeqCst);
        assert_eq!(h.session.status().clips_completed, 1);
        assert!(h.graph.snapshot().sub_graphs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_share_one_clip() {
        let h = harness(Duration::from_millis(200));
        let running = feed(h.point.clone());

        let a = h.session.clone();
        let b = h.session.clone();
        let (pa, pb) = tokio::join!(
            tokio::task::spawn_blocking(move || a.trigger()),
            tokio::task::spawn_blocking(move || b.trigger()),
        );
        let (pa, pb) = (pa.unwrap().unwrap(), pb.unwrap().unwrap());
        assert_eq!(pa, pb);
        assert!(pa.ends_with("event_0_0.mjpeg"));
        assert_eq!(h.graph.sub_graph_count(), 1);

        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(2)).await);
        running.store(false, Ordering::SeqCst);
        assert_eq!(h.session.status().clips_completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_before_attach_returns_to_idle() {
        // No samples flow, so the attach probe never fires
        let h = harness(Duration::from_millis(30));
        let s = h.session.clone();
        tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert_eq!(h.session.state(), RecordingState::Starting);
        assert_eq!(h.point.probe_count(), 1);

        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(1)).await);
        assert_eq!(h.point.probe_count(), 0);
        assert_eq!(h.graph.sub_graph_count(), 0);
        assert_eq!(h.session.status().clips_completed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trigger_times_out_while_starting() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LiveGraph::new("main");
        let point = graph.add_flow_point("appsink_0");
        point.set_caps(Caps::new("image/jpeg", 320, 240, 50));
        let mut s = settings(dir.path(), Duration::from_secs(5));
        s.wait_start = Duration::from_millis(50);
        let session = RecordingSession::new(
            "0",
            point,
            GraphMutator::new(graph, Scheduler::current()),
            Arc::new(EventBus::new()),
            s,
        );

        let first = session.clone();
        tokio::task::spawn_blocking(move || first.trigger()).await.unwrap().unwrap();
        let second = session.clone();
        let err = tokio::task::spawn_blocking(move || second.trigger())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_construction_failure_keeps_session_usable() {
        let h = harness(Duration::from_millis(100));
        std::fs::remove_dir_all(&h.session.settings.output_dir).unwrap();
        let mut rx = h.events.subscribe();
        let running = feed(h.point.clone());

        let s = h.session.clone();
        tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(1)).await);
        assert!(h.session.status().last_failure.is_some());
        assert_eq!(h.graph.sub_graph_count(), 0);

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if let SystemEvent::RecordingFailed { kind, .. } = event {
                assert_eq!(kind, "construction_failure");
                failed = true;
            }
        }
        assert!(failed);

        std::fs::create_dir_all(&h.session.settings.output_dir).unwrap();
        let s = h.session.clone();
        let path = tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(path.ends_with("event_0_1.mjpeg"));
        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);
        h.session.finish_now();
        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(1)).await);
        running.store(false, Ordering::SeqCst);
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rearm_while_stop_timer_fires_keeps_recording() {
        let h = harness(Duration::from_millis(100));
        let running = feed(h.point.clone());

        let armed_at = Instant::now();
        let s = h.session.clone();
        tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);

        // Stop is due 200ms after the trigger. Hold the lock across that
        // deadline so the callback is already running, then re-arm.
        let until = (armed_at + Duration::from_millis(120)).saturating_duration_since(Instant::now());
        tokio::time::sleep(until).await;
        let s = h.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut inner = s.inner.lock();
            thread::sleep(Duration::from_millis(250));
            s.arm_stop_timer(&mut inner);
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.session.state(), RecordingState::Recording);
        assert_eq!(h.graph.sub_graph_count(), 1);

        // The re-armed timer still ends the clip
        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(2)).await);
        running.store(false, Ordering::SeqCst);
        assert_eq!(h.session.status().clips_completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trigger_while_finishing_starts_next_clip() {
        let h = harness(Duration::from_secs(5));
        let running = feed(h.point.clone());

        let s = h.session.clone();
        let first = tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let s = h.session.clone();
        let next = tokio::task::spawn_blocking(move || {
            s.finish_now();
            s.trigger()
        })
        .await
        .unwrap()
        .unwrap();
        assert!(first.ends_with("event_0_0.mjpeg"));
        assert!(next.ends_with("event_0_1.mjpeg"));
        // The previous clip was disposed before the next one started
        assert_eq!(h.session.status().clips_completed, 1);
        assert!(first.exists());

        assert!(wait_for(&h.session, RecordingState::Recording, Duration::from_secs(1)).await);
        h.session.finish_now();
        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(1)).await);
        running.store(false, Ordering::SeqCst);
        assert_eq!(h.session.status().clips_completed, 2);
        assert!(next.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trigger_conflicts_when_retries_run_out() {
        // No samples flow, so every start stays in STARTING
        let h = harness_with(Duration::from_secs(5), |s| {
            s.retry_tick = Duration::from_millis(300);
        });
        let s = h.session.clone();
        tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();

        let s = h.session.clone();
        let waiting = tokio::task::spawn_blocking(move || s.trigger());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Settle the first start, then start another clip during the retry tick
        h.session.finish_now();
        assert_eq!(h.session.state(), RecordingState::Idle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let s = h.session.clone();
        let second = tokio::task::spawn_blocking(move || s.trigger()).await.unwrap().unwrap();
        assert!(second.ends_with("event_0_1.mjpeg"));

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(h.session.state(), RecordingState::Starting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clip_starts_with_lookback_oldest_first() {
        let h = harness_with(Duration::from_secs(2), |s| s.fps = 30);
        assert_eq!(h.session.lookback_capacity(), 60);

        let point = h.point.clone();
        let session = h.session.clone();
        let path = tokio::task::spawn_blocking(move || {
            let push = |seq: u64| {
                point.push(Sample::new(
                    vec![seq as u8],
                    Duration::from_millis(seq * 33),
                    Duration::from_millis(33),
                    seq,
                ))
            };
            for seq in 0..100 {
                push(seq);
            }
            let path = session.trigger().unwrap();
            // Attaches, drains the lookback, then records this sample live
            push(100);
            path
        })
        .await
        .unwrap();
        assert_eq!(h.session.state(), RecordingState::Recording);

        h.session.finish_now();
        assert!(wait_for(&h.session, RecordingState::Idle, Duration::from_secs(1)).await);
        let written = std::fs::read(&path).unwrap();
        let expected: Vec<u8> = (40..=100).collect();
        assert_eq!(written, expected);
    }
}
