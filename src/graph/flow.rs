//! Flow points and data-flow interception
//!
//! A [`FlowPoint`] is a named place in the live graph where samples pass from
//! a producer to its linked consumers. Three interception kinds are offered:
//!
//! - **buffer probes** run on the pushing thread for every sample, before the
//!   sample reaches any consumer
//! - **event probes** run the same way for stream events (end-of-stream)
//! - **block** holds the flow lock while a closure runs, so no sample is in
//!   flight through the point during e.g. an unlink
//!
//! Probes decide their own fate through [`ProbeReturn`]; a probe returning
//! `Remove` or `Consume` never runs again, which is what makes attach and
//! detach single-shot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use super::sample::{Caps, Sample};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Out-of-band stream events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    /// No further samples will follow
    Eos,
}

/// Outcome of a push through a flow point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    /// Delivered to at least one consumer
    Ok,
    /// A probe dropped the item
    Dropped,
    /// No consumer is linked
    NotLinked,
}

/// What a probe wants done with itself and the item it saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Keep the probe, let the item through
    Pass,
    /// Remove the probe, let the item through
    Remove,
    /// Keep the probe, drop the item
    Drop,
    /// Remove the probe and drop the item
    Consume,
}

impl ProbeReturn {
    fn keeps_probe(self) -> bool {
        matches!(self, ProbeReturn::Pass | ProbeReturn::Drop)
    }

    fn passes_item(self) -> bool {
        matches!(self, ProbeReturn::Pass | ProbeReturn::Remove)
    }
}

/// Probe kind selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Buffer,
    Event,
}

/// The item a probe is inspecting
#[derive(Debug)]
pub enum ProbeInfo<'a> {
    Buffer(&'a Sample),
    Event(&'a FlowEvent),
}

/// Identifier of an installed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

type ProbeFn = Box<dyn FnMut(&FlowPoint, ProbeInfo<'_>) -> ProbeReturn + Send>;

struct ProbeEntry {
    id: ProbeId,
    kind: ProbeKind,
    callback: ProbeFn,
}

#[derive(Default)]
struct ProbeTable {
    entries: Vec<ProbeEntry>,
    /// Removals requested while the probe was executing
    withdrawn: HashSet<ProbeId>,
}

/// Downstream receiver of samples linked to a flow point
pub trait SampleConsumer: Send + Sync {
    /// Unique name of the consumer on its flow point
    fn name(&self) -> &str;

    /// Handle one sample. Runs on the pushing (data-flow) thread and must not
    /// block.
    fn on_sample(&self, sample: &Sample) -> Result<()>;

    /// Handle a stream event
    fn on_event(&self, _event: &FlowEvent) {}
}

/// Named, addressable point of the live graph
pub struct FlowPoint {
    name: String,
    caps: RwLock<Option<Caps>>,
    consumers: RwLock<Vec<Arc<dyn SampleConsumer>>>,
    probes: Mutex<ProbeTable>,
    /// Held for the duration of every push; `block` takes it too
    flow: Mutex<()>,
    next_probe_id: AtomicU64,
    samples_pushed: AtomicU64,
    eos: AtomicBool,
    throttler: LogThrottler,
}

impl FlowPoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            caps: RwLock::new(None),
            consumers: RwLock::new(Vec::new()),
            probes: Mutex::new(ProbeTable::default()),
            flow: Mutex::new(()),
            next_probe_id: AtomicU64::new(1),
            samples_pushed: AtomicU64::new(0),
            eos: AtomicBool::new(false),
            throttler: LogThrottler::default(),
        })
    }

    pub fn with_caps(name: impl Into<String>, caps: Caps) -> Arc<Self> {
        let point = Self::new(name);
        point.set_caps(caps);
        point
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently negotiated caps, if any
    pub fn caps(&self) -> Option<Caps> {
        self.caps.read().clone()
    }

    pub fn set_caps(&self, caps: Caps) {
        *self.caps.write() = Some(caps);
    }

    pub fn samples_pushed(&self) -> u64 {
        self.samples_pushed.load(Ordering::Relaxed)
    }

    /// Whether end-of-stream has passed through this point
    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Link a consumer; names must be unique per point
    pub fn link(&self, consumer: Arc<dyn SampleConsumer>) -> Result<()> {
        let mut consumers = self.consumers.write();
        if consumers.iter().any(|c| c.name() == consumer.name()) {
            return Err(AppError::Graph(format!(
                "'{}' is already linked to '{}'",
                consumer.name(),
                self.name
            )));
        }
        trace!("Linking '{}' -> '{}'", self.name, consumer.name());
        consumers.push(consumer);
        Ok(())
    }

    /// Unlink a consumer by name, returning whether it was linked
    pub fn unlink(&self, consumer_name: &str) -> bool {
        let mut consumers = self.consumers.write();
        let before = consumers.len();
        consumers.retain(|c| c.name() != consumer_name);
        let removed = consumers.len() != before;
        if removed {
            trace!("Unlinked '{}' from '{}'", consumer_name, self.name);
        }
        removed
    }

    pub fn is_linked(&self, consumer_name: &str) -> bool {
        self.consumers.read().iter().any(|c| c.name() == consumer_name)
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    /// Install a probe; it runs on whichever thread pushes the next item
    pub fn add_probe<F>(&self, kind: ProbeKind, callback: F) -> ProbeId
    where
        F: FnMut(&FlowPoint, ProbeInfo<'_>) -> ProbeReturn + Send + 'static,
    {
        let id = ProbeId(self.next_probe_id.fetch_add(1, Ordering::Relaxed));
        self.probes.lock().entries.push(ProbeEntry {
            id,
            kind,
            callback: Box::new(callback),
        });
        trace!("Installed {:?} probe {:?} on '{}'", kind, id, self.name);
        id
    }

    /// Remove a probe that has not fired yet
    ///
    /// Returns `false` when the probe is gone or currently executing; an
    /// executing probe that asked to stay installed is discarded afterwards.
    pub fn remove_probe(&self, id: ProbeId) -> bool {
        let mut table = self.probes.lock();
        if let Some(pos) = table.entries.iter().position(|p| p.id == id) {
            table.entries.remove(pos);
            true
        } else {
            table.withdrawn.insert(id);
            false
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().entries.len()
    }

    /// Run probes of `kind`; returns whether the item should pass
    fn run_probes(&self, kind: ProbeKind, info: ProbeInfo<'_>) -> bool {
        // Take matching probes out so callbacks run without the table lock
        let mut running: Vec<ProbeEntry> = {
            let mut table = self.probes.lock();
            if !table.entries.iter().any(|p| p.kind == kind) {
                return true;
            }
            let (matching, rest): (Vec<_>, Vec<_>) =
                table.entries.drain(..).partition(|p| p.kind == kind);
            table.entries = rest;
            matching
        };

        let mut pass = true;
        let mut keep = Vec::with_capacity(running.len());
        for mut entry in running.drain(..) {
            let item = match &info {
                ProbeInfo::Buffer(s) => ProbeInfo::Buffer(*s),
                ProbeInfo::Event(e) => ProbeInfo::Event(*e),
            };
            let ret = (entry.callback)(self, item);
            trace!("Probe {:?} on '{}' returned {:?}", entry.id, self.name, ret);
            if !ret.passes_item() {
                pass = false;
            }
            if ret.keeps_probe() {
                keep.push(entry);
            } else {
                self.probes.lock().withdrawn.remove(&entry.id);
            }
        }

        if !keep.is_empty() {
            let mut table = self.probes.lock();
            for entry in keep {
                if !table.withdrawn.remove(&entry.id) {
                    table.entries.push(entry);
                }
            }
        }
        pass
    }

    // ------------------------------------------------------------------
    // Data flow
    // ------------------------------------------------------------------

    /// Push one sample through the point (data-flow thread)
    pub fn push(&self, sample: Sample) -> FlowReturn {
        let _flow = self.flow.lock();
        self.samples_pushed.fetch_add(1, Ordering::Relaxed);

        if !self.run_probes(ProbeKind::Buffer, ProbeInfo::Buffer(&sample)) {
            return FlowReturn::Dropped;
        }

        let consumers = self.consumers.read().clone();
        if consumers.is_empty() {
            return FlowReturn::NotLinked;
        }
        for consumer in consumers {
            if let Err(e) = consumer.on_sample(&sample) {
                warn_throttled!(
                    self.throttler,
                    consumer.name(),
                    "Consumer '{}' on '{}' rejected sample {}: {}",
                    consumer.name(),
                    self.name,
                    sample.sequence,
                    e
                );
            }
        }
        FlowReturn::Ok
    }

    /// Push a stream event through the point
    pub fn push_event(&self, event: FlowEvent) -> FlowReturn {
        let _flow = self.flow.lock();

        if !self.run_probes(ProbeKind::Event, ProbeInfo::Event(&event)) {
            return FlowReturn::Dropped;
        }
        if event == FlowEvent::Eos {
            self.eos.store(true, Ordering::SeqCst);
        }

        let consumers = self.consumers.read().clone();
        if consumers.is_empty() {
            return FlowReturn::NotLinked;
        }
        for consumer in consumers {
            consumer.on_event(&event);
        }
        FlowReturn::Ok
    }

    /// Run `f` with the data path paused
    ///
    /// Waits for an in-flight push to complete and keeps further pushes out
    /// until `f` returns. Must not be called from a probe or consumer of this
    /// same point.
    pub fn block<R>(&self, f: impl FnOnce(&FlowPoint) -> R) -> R {
        let _flow = self.flow.lock();
        trace!("Flow through '{}' blocked", self.name);
        f(self)
    }
}

impl std::fmt::Debug for FlowPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPoint")
            .field("name", &self.name)
            .field("caps", &self.caps())
            .field("consumers", &self.consumer_names())
            .finish()
    }
}

/// Consumer forwarding everything into another flow point (a tee branch)
pub struct TeeBranch {
    name: String,
    target: Arc<FlowPoint>,
}

impl TeeBranch {
    pub fn new(target: Arc<FlowPoint>) -> Arc<Self> {
        Arc::new(Self {
            name: format!("tee:{}", target.name()),
            target,
        })
    }
}

impl SampleConsumer for TeeBranch {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_sample(&self, sample: &Sample) -> Result<()> {
        self.target.push(sample.clone());
        Ok(())
    }

    fn on_event(&self, event: &FlowEvent) {
        self.target.push_event(*event);
    }
}
