//! Attach and detach of transient sub-graphs on a live graph
//!
//! # Attach
//!
//! A one-shot buffer probe is installed on the live flow point. The next
//! sample to arrive runs the probe on the data-flow thread *before* that
//! sample is forwarded: the sub-graph is built, added to the graph, linked (in
//! [`SpliceMode::LinkToPoint`]) and synced to the parent's run state, and the
//! probe removes itself. The sample that triggered the probe is therefore the
//! first one the new sub-graph can see.
//!
//! # Detach
//!
//! An event probe is installed on the sub-graph's output, the sub-graph is
//! unlinked under a block of the live point (if it was linked there), and
//! end-of-stream is queued into it. When EOS comes out the other end the
//! sub-graph is removed from the graph and its NULL transition is deferred to
//! the scheduler; it never runs on a data-flow thread.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::flow::{FlowEvent, FlowPoint, ProbeId, ProbeInfo, ProbeKind, ProbeReturn};
use super::sample::{Caps, Sample};
use super::subgraph::TransientSubGraph;
use super::{LiveGraph, RunState};
use crate::error::{AppError, Result};
use crate::utils::Scheduler;

/// How a freshly built sub-graph receives samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceMode {
    /// The caller feeds the sub-graph input itself
    Owned,
    /// The sub-graph input is linked as a consumer of the flow point
    LinkToPoint,
}

/// Pending attach; can be withdrawn until the probe fires
#[derive(Debug)]
pub struct AttachHandle {
    point: Arc<FlowPoint>,
    probe: ProbeId,
}

impl AttachHandle {
    /// Withdraw the attach probe
    ///
    /// Returns `false` if the probe already ran or is running right now, in
    /// which case the attach callback will still be delivered.
    pub fn withdraw(&self) -> bool {
        let withdrawn = self.point.remove_probe(self.probe);
        if withdrawn {
            debug!("Withdrew attach probe on '{}'", self.point.name());
        }
        withdrawn
    }

    pub fn point(&self) -> &Arc<FlowPoint> {
        &self.point
    }
}

/// The only path through which transient sub-graphs enter or leave the graph
#[derive(Clone)]
pub struct GraphMutator {
    graph: Arc<LiveGraph>,
    scheduler: Scheduler,
}

impl GraphMutator {
    pub fn new(graph: Arc<LiveGraph>, scheduler: Scheduler) -> Self {
        Self { graph, scheduler }
    }

    pub fn graph(&self) -> &Arc<LiveGraph> {
        &self.graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Attach a sub-graph at `point` on the next sample
    ///
    /// `build` receives the triggering sample and the point's caps.
    /// `on_attached` runs exactly once on the data-flow thread, after the
    /// sub-graph is in the parent's run state and before the triggering
    /// sample reaches any consumer.
    pub fn attach<B, C>(
        &self,
        point: &Arc<FlowPoint>,
        mode: SpliceMode,
        build: B,
        on_attached: C,
    ) -> AttachHandle
    where
        B: FnOnce(&Sample, Option<Caps>) -> Result<Arc<dyn TransientSubGraph>> + Send + 'static,
        C: FnOnce(Result<Arc<dyn TransientSubGraph>>) + Send + 'static,
    {
        let mutator = self.clone();
        let mut pending = Some((build, on_attached));

        let probe = point.add_probe(ProbeKind::Buffer, move |point, info| {
            let ProbeInfo::Buffer(sample) = info else {
                return ProbeReturn::Pass;
            };
            // Single construction per probe
            let Some((build, on_attached)) = pending.take() else {
                return ProbeReturn::Remove;
            };
            let result = mutator.splice(point, mode, sample, build);
            on_attached(result);
            ProbeReturn::Remove
        });

        debug!("Attach probe {:?} armed on '{}' ({:?})", probe, point.name(), mode);
        AttachHandle {
            point: point.clone(),
            probe,
        }
    }

    fn splice<B>(
        &self,
        point: &FlowPoint,
        mode: SpliceMode,
        sample: &Sample,
        build: B,
    ) -> Result<Arc<dyn TransientSubGraph>>
    where
        B: FnOnce(&Sample, Option<Caps>) -> Result<Arc<dyn TransientSubGraph>>,
    {
        let sub = build(sample, point.caps()).map_err(|e| match e {
            AppError::ConstructionFailure(_) => e,
            other => AppError::ConstructionFailure(other.to_string()),
        })?;

        let linked = |sub: &Arc<dyn TransientSubGraph>| -> Result<()> {
            self.graph.add(sub.clone())?;
            if mode == SpliceMode::LinkToPoint {
                point.link(sub.input())?;
            }
            sub.sync_state_with_parent(&self.graph)
        };

        match linked(&sub) {
            Ok(()) => {
                info!(
                    "Attached '{}' at '{}' on sample {}",
                    sub.name(),
                    point.name(),
                    sample.sequence
                );
                Ok(sub)
            }
            Err(e) => {
                error!("Failed to splice '{}' at '{}': {}", sub.name(), point.name(), e);
                if mode == SpliceMode::LinkToPoint {
                    point.unlink(sub.name());
                }
                self.graph.remove(sub.name());
                self.dispose_later(sub.clone(), |_| {});
                Err(AppError::ConstructionFailure(format!("{}: {}", sub.name(), e)))
            }
        }
    }

    /// Detach `sub` through end-of-stream
    ///
    /// `link_point` is the live point the sub-graph input is linked to, if
    /// any. `on_disposed` runs exactly once on a scheduler thread after the
    /// sub-graph reached NULL; it also runs when EOS could not be delivered,
    /// in which case this returns the delivery error.
    pub fn detach<C>(
        &self,
        sub: Arc<dyn TransientSubGraph>,
        link_point: Option<Arc<FlowPoint>>,
        on_disposed: C,
    ) -> Result<()>
    where
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let name = sub.name().to_string();
        let weak: Weak<dyn TransientSubGraph> = Arc::downgrade(&sub);
        let mutator = self.clone();
        let slot = Arc::new(Mutex::new(Some(on_disposed)));

        let output = sub.output();
        let probe = {
            let slot = slot.clone();
            output.add_probe(ProbeKind::Event, move |_, info| {
                if !matches!(info, ProbeInfo::Event(FlowEvent::Eos)) {
                    return ProbeReturn::Pass;
                }
                let Some(on_disposed) = slot.lock().take() else {
                    return ProbeReturn::Consume;
                };
                match weak.upgrade() {
                    Some(sub) => {
                        debug!("EOS observed on '{}', scheduling disposal", sub.name());
                        mutator.graph.remove(sub.name());
                        mutator.dispose_later(sub, on_disposed);
                    }
                    None => on_disposed(Ok(())),
                }
                ProbeReturn::Consume
            })
        };

        // The sub-graph input is linked under the sub-graph's name
        if let Some(point) = link_point {
            if !point.block(|p| p.unlink(&name)) {
                debug!("'{}' was not linked to '{}'", name, point.name());
            }
        }

        info!("Detaching '{}'", name);
        if let Err(e) = sub.send_eos() {
            warn!("EOS could not be delivered to '{}': {}", name, e);
            // Nobody will observe EOS; dispose directly if the probe is still ours
            if output.remove_probe(probe) {
                if let Some(on_disposed) = slot.lock().take() {
                    self.graph.remove(&name);
                    self.dispose_later(sub, on_disposed);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Bring `sub` to NULL on a scheduler thread, then call `on_disposed`
    fn dispose_later<C>(&self, sub: Arc<dyn TransientSubGraph>, on_disposed: C)
    where
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let name = format!("dispose:{}", sub.name());
        self.scheduler.defer(name, move || {
            let result = sub.set_state(RunState::Null);
            match &result {
                Ok(()) => debug!("Disposed '{}'", sub.name()),
                Err(e) => warn!("Disposing '{}' failed: {}", sub.name(), e),
            }
            drop(sub);
            on_disposed(result);
        });
    }
}
