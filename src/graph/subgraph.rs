//! Transient sub-graphs
//!
//! A transient sub-graph is built from a typed [`SubGraphSpec`], validated
//! before anything is started, and runs its stages on a worker thread of its
//! own. Its input is a non-blocking [`SampleConsumer`]; its output is a
//! [`FlowPoint`] on which end-of-stream appears once the terminal sink has
//! been flushed and closed.
//!
//! ```text
//! input (try_send) ──> [queue] ──> worker thread ──> sink.write()
//!                                        │
//!                                   Eos: sink.finish()
//!                                        │
//!                                        v
//!                                  output FlowPoint ── Eos event
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::flow::{FlowEvent, FlowPoint, SampleConsumer};
use super::sample::{Caps, Sample};
use super::{LiveGraph, RunState};
use crate::error::{AppError, Result};

/// Default queue depth when no queue stage is given
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Terminal stage receiving the samples of a sub-graph
pub trait MediaSink: Send {
    /// Short description for logs and graph snapshots
    fn describe(&self) -> String;

    /// Acquire resources (called on the NULL → READY transition)
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, sample: &Sample) -> Result<()>;

    /// Flush and release resources; called exactly once
    fn finish(&mut self) -> Result<()>;
}

/// Sink appending every sample payload to a file
pub struct FileSink {
    location: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileSink {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            writer: None,
            bytes_written: 0,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}

impl MediaSink for FileSink {
    fn describe(&self) -> String {
        format!("filesink location={}", self.location.display())
    }

    fn open(&mut self) -> Result<()> {
        let file = File::create(&self.location)?;
        self.writer = Some(BufWriter::new(file));
        debug!("Opened clip file {}", self.location.display());
        Ok(())
    }

    fn write(&mut self, sample: &Sample) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(AppError::Graph(format!("{} is not open", self.describe())));
        };
        writer.write_all(&sample.data)?;
        self.bytes_written += sample.data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            debug!(
                "Closed clip file {} ({} bytes)",
                self.location.display(),
                self.bytes_written
            );
        }
        Ok(())
    }
}

/// Typed stage descriptor
pub enum StageSpec {
    /// Decoupling queue; the stage after it runs on the worker thread
    Queue { capacity: usize },
    /// Terminal file writer
    FileSink { location: PathBuf },
    /// Terminal custom sink
    Sink(Box<dyn MediaSink>),
}

impl StageSpec {
    fn is_sink(&self) -> bool {
        matches!(self, StageSpec::FileSink { .. } | StageSpec::Sink(_))
    }

    fn describe(&self) -> String {
        match self {
            StageSpec::Queue { capacity } => format!("queue max-size-buffers={}", capacity),
            StageSpec::FileSink { location } => format!("filesink location={}", location.display()),
            StageSpec::Sink(sink) => sink.describe(),
        }
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Description of a transient sub-graph, validated before construction
#[derive(Debug)]
pub struct SubGraphSpec {
    name: String,
    caps: Option<Caps>,
    stages: Vec<StageSpec>,
}

impl SubGraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            caps: None,
            stages: Vec::new(),
        }
    }

    /// Caps of the samples that will be fed in
    pub fn caps(mut self, caps: Option<Caps>) -> Self {
        self.caps = caps;
        self
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description, `a ! b ! c`
    pub fn describe(&self) -> String {
        self.stages
            .iter()
            .map(StageSpec::describe)
            .collect::<Vec<_>>()
            .join(" ! ")
    }

    /// Check the description without side effects
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(AppError::ConstructionFailure(format!("{}: {}", self.name, reason)))
        };

        if self.name.trim().is_empty() {
            return fail("sub-graph name is empty".to_string());
        }
        match &self.caps {
            None => return fail("upstream caps are not negotiated".to_string()),
            Some(caps) if !caps.is_fixed() => {
                return fail(format!("upstream caps are not fixed: {}", caps))
            }
            Some(_) => {}
        }

        let Some(last) = self.stages.last() else {
            return fail("no stages".to_string());
        };
        if !last.is_sink() {
            return fail(format!("last stage '{}' is not a sink", last.describe()));
        }
        if self.stages.iter().filter(|s| s.is_sink()).count() != 1 {
            return fail("exactly one sink stage is allowed".to_string());
        }
        if self
            .stages
            .iter()
            .filter(|s| matches!(s, StageSpec::Queue { .. }))
            .count()
            > 1
        {
            return fail("at most one queue stage is allowed".to_string());
        }

        for stage in &self.stages {
            match stage {
                StageSpec::Queue { capacity } if *capacity == 0 => {
                    return fail("queue capacity must be positive".to_string());
                }
                StageSpec::FileSink { location } => {
                    if location.file_name().is_none() {
                        return fail(format!("'{}' has no file name", location.display()));
                    }
                    let parent = location.parent().unwrap_or_else(|| Path::new("."));
                    let parent = if parent.as_os_str().is_empty() {
                        Path::new(".")
                    } else {
                        parent
                    };
                    if !parent.is_dir() {
                        return fail(format!("directory '{}' does not exist", parent.display()));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate and construct the sub-graph in the NULL state
    pub fn build(self) -> Result<Arc<ChainSubGraph>> {
        self.validate()?;
        let description = self.describe();

        let mut capacity = DEFAULT_QUEUE_CAPACITY;
        let mut sink: Option<Box<dyn MediaSink>> = None;
        for stage in self.stages {
            match stage {
                StageSpec::Queue { capacity: c } => capacity = c,
                StageSpec::FileSink { location } => sink = Some(Box::new(FileSink::new(location))),
                StageSpec::Sink(s) => sink = Some(s),
            }
        }
        let sink = sink.ok_or_else(|| {
            AppError::ConstructionFailure(format!("{}: no sink stage", self.name))
        })?;

        Ok(Arc::new(ChainSubGraph {
            shared: Arc::new(ChainShared {
                name: self.name.clone(),
                description,
                caps: self.caps,
                state: Mutex::new(RunState::Null),
                sender: Mutex::new(None),
                worker: Mutex::new(None),
                pending_sink: Mutex::new(Some(sink)),
                capacity,
                eos_sent: AtomicBool::new(false),
                samples_in: AtomicU64::new(0),
                samples_dropped: AtomicU64::new(0),
                output: FlowPoint::new(format!("{}:src", self.name)),
            }),
        }))
    }
}

/// Operations every transient sub-graph offers to the graph mutator
pub trait TransientSubGraph: Send + Sync {
    fn name(&self) -> &str;

    fn describe(&self) -> String;

    fn state(&self) -> RunState;

    /// Change run state. Going to NULL releases all resources and must not be
    /// called from the sub-graph's own data-flow thread.
    fn set_state(&self, state: RunState) -> Result<()>;

    /// Bring the sub-graph to the run state of its parent graph
    fn sync_state_with_parent(&self, parent: &LiveGraph) -> Result<()> {
        self.set_state(parent.state())
    }

    /// Entry point for samples
    fn input(&self) -> Arc<dyn SampleConsumer>;

    /// Flow point where end-of-stream is observed after the sink closed
    fn output(&self) -> Arc<FlowPoint>;

    /// Queue end-of-stream; safe from any thread
    fn send_eos(&self) -> Result<()>;
}

enum QueueItem {
    Sample(Sample),
    Eos,
}

struct ChainShared {
    name: String,
    description: String,
    caps: Option<Caps>,
    state: Mutex<RunState>,
    sender: Mutex<Option<SyncSender<QueueItem>>>,
    worker: Mutex<Option<(ThreadId, JoinHandle<()>)>>,
    /// Sink waiting for the worker to start
    pending_sink: Mutex<Option<Box<dyn MediaSink>>>,
    capacity: usize,
    eos_sent: AtomicBool,
    samples_in: AtomicU64,
    samples_dropped: AtomicU64,
    output: Arc<FlowPoint>,
}

/// Linear queue → sink sub-graph with a dedicated worker thread
pub struct ChainSubGraph {
    shared: Arc<ChainShared>,
}

/// Input consumer handed to upstream producers
struct ChainInput {
    name: String,
    shared: Arc<ChainShared>,
}

impl ChainSubGraph {
    pub fn caps(&self) -> Option<&Caps> {
        self.shared.caps.as_ref()
    }

    /// Samples accepted into the queue
    pub fn samples_in(&self) -> u64 {
        self.shared.samples_in.load(Ordering::Relaxed)
    }

    /// Samples discarded because the queue was full
    pub fn samples_dropped(&self) -> u64 {
        self.shared.samples_dropped.load(Ordering::Relaxed)
    }

    fn start_worker(&self) -> Result<()> {
        let shared = &self.shared;
        let mut sink = shared.pending_sink.lock().take().ok_or_else(|| {
            AppError::Graph(format!("{}: sub-graph cannot be restarted", shared.name))
        })?;
        if let Err(e) = sink.open() {
            return Err(AppError::ConstructionFailure(format!(
                "{}: {} failed to open: {}",
                shared.name,
                sink.describe(),
                e
            )));
        }

        let (tx, rx) = mpsc::sync_channel(shared.capacity);
        let output = shared.output.clone();
        let name = shared.name.clone();
        let handle = thread::Builder::new()
            .name(format!("sg-{}", shared.name))
            .spawn(move || run_worker(name, rx, sink, output))
            .map_err(|e| {
                AppError::ConstructionFailure(format!("{}: worker spawn failed: {}", shared.name, e))
            })?;

        let id = handle.thread().id();
        *shared.worker.lock() = Some((id, handle));
        *shared.sender.lock() = Some(tx);
        Ok(())
    }

    fn stop_worker(&self) -> Result<()> {
        let shared = &self.shared;
        let worker = {
            let mut worker = shared.worker.lock();
            if let Some((id, _)) = worker.as_ref() {
                if *id == thread::current().id() {
                    return Err(AppError::Graph(format!(
                        "{}: state change to NULL from its own data-flow thread",
                        shared.name
                    )));
                }
            }
            worker.take()
        };
        // Closing the channel ends the worker loop
        shared.sender.lock().take();
        if let Some((_, handle)) = worker {
            if handle.join().is_err() {
                warn!("Sub-graph '{}' worker panicked", shared.name);
            }
        }
        Ok(())
    }
}

fn run_worker(
    name: String,
    rx: Receiver<QueueItem>,
    mut sink: Box<dyn MediaSink>,
    output: Arc<FlowPoint>,
) {
    let mut written = 0u64;
    let mut finished = false;
    for item in rx.iter() {
        match item {
            QueueItem::Sample(sample) => {
                if let Err(e) = sink.write(&sample) {
                    warn!("Sub-graph '{}' failed to write sample {}: {}", name, sample.sequence, e);
                } else {
                    written += 1;
                }
            }
            QueueItem::Eos => {
                if let Err(e) = sink.finish() {
                    warn!("Sub-graph '{}' failed to finish sink: {}", name, e);
                }
                finished = true;
                debug!("Sub-graph '{}' reached EOS after {} samples", name, written);
                output.push_event(FlowEvent::Eos);
                break;
            }
        }
    }
    if !finished {
        // Torn down without EOS: still close the sink
        if let Err(e) = sink.finish() {
            warn!("Sub-graph '{}' failed to finish sink: {}", name, e);
        }
    }
}

impl TransientSubGraph for ChainSubGraph {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn describe(&self) -> String {
        self.shared.description.clone()
    }

    fn state(&self) -> RunState {
        *self.shared.state.lock()
    }

    fn set_state(&self, target: RunState) -> Result<()> {
        let current = self.state();
        if current == target {
            return Ok(());
        }

        if target == RunState::Null {
            self.stop_worker()?;
        } else if current == RunState::Null {
            self.start_worker()?;
        }

        *self.shared.state.lock() = target;
        info!("Sub-graph '{}' {} -> {}", self.shared.name, current, target);
        Ok(())
    }

    fn input(&self) -> Arc<dyn SampleConsumer> {
        Arc::new(ChainInput {
            name: self.shared.name.clone(),
            shared: self.shared.clone(),
        })
    }

    fn output(&self) -> Arc<FlowPoint> {
        self.shared.output.clone()
    }

    fn send_eos(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.eos_sent.swap(true, Ordering::SeqCst) {
            debug!("EOS already sent to '{}'", shared.name);
            return Ok(());
        }
        let sender = shared.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(QueueItem::Eos).map_err(|_| {
                AppError::Graph(format!("{}: worker is gone, EOS not delivered", shared.name))
            }),
            None => Err(AppError::Graph(format!(
                "{}: not running, EOS not delivered",
                shared.name
            ))),
        }
    }
}

impl SampleConsumer for ChainInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_sample(&self, sample: &Sample) -> Result<()> {
        let shared = &self.shared;
        if *shared.state.lock() != RunState::Playing {
            return Err(AppError::Graph(format!("{} is not playing", shared.name)));
        }
        if shared.eos_sent.load(Ordering::SeqCst) {
            return Err(AppError::Graph(format!("{} is draining", shared.name)));
        }
        let sender = shared.sender.lock().clone();
        let Some(tx) = sender else {
            return Err(AppError::Graph(format!("{} has no worker", shared.name)));
        };
        match tx.try_send(QueueItem::Sample(sample.clone())) {
            Ok(()) => {
                shared.samples_in.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                shared.samples_dropped.fetch_add(1, Ordering::Relaxed);
                Err(AppError::Graph(format!("{} queue is full", shared.name)))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(AppError::Graph(format!("{} worker is gone", shared.name)))
            }
        }
    }
}

/// Snapshot of one attached sub-graph
#[derive(Debug, Clone, Serialize)]
pub struct SubGraphSnapshot {
    pub name: String,
    pub state: RunState,
    pub description: String,
}
