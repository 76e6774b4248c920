//! Live media graph
//!
//! The long-running graph owns named [`FlowPoint`]s (one per source sink plus
//! the distribution point) and the set of transient sub-graphs currently
//! attached to it. Sub-graphs are added and removed while samples keep
//! flowing; see [`mutator`] for the attach/detach protocols.

pub mod flow;
pub mod mutator;
pub mod sample;
pub mod source;
pub mod subgraph;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

pub use flow::{
    FlowEvent, FlowPoint, FlowReturn, ProbeId, ProbeInfo, ProbeKind, ProbeReturn, SampleConsumer,
    TeeBranch,
};
pub use mutator::{AttachHandle, GraphMutator, SpliceMode};
pub use sample::{Caps, Sample};
pub use source::SyntheticSource;
pub use subgraph::{
    ChainSubGraph, FileSink, MediaSink, StageSpec, SubGraphSnapshot, SubGraphSpec,
    TransientSubGraph,
};

/// Run state of a graph or sub-graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Null => "NULL",
            RunState::Ready => "READY",
            RunState::Paused => "PAUSED",
            RunState::Playing => "PLAYING",
        };
        f.write_str(s)
    }
}

/// Serializable view of one flow point
#[derive(Debug, Clone, Serialize)]
pub struct FlowPointSnapshot {
    pub name: String,
    pub caps: Option<String>,
    pub consumers: Vec<String>,
    pub probes: usize,
    pub samples_pushed: u64,
}

/// Serializable view of the whole graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub name: String,
    pub state: RunState,
    pub flow_points: Vec<FlowPointSnapshot>,
    pub sub_graphs: Vec<SubGraphSnapshot>,
}

/// The long-running graph
pub struct LiveGraph {
    name: String,
    state: RwLock<RunState>,
    points: RwLock<HashMap<String, Arc<FlowPoint>>>,
    children: Mutex<HashMap<String, Arc<dyn TransientSubGraph>>>,
}

impl LiveGraph {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: RwLock::new(RunState::Null),
            points: RwLock::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    /// Register a flow point, or return the existing one with that name
    pub fn add_flow_point(&self, name: &str) -> Arc<FlowPoint> {
        self.points
            .write()
            .entry(name.to_string())
            .or_insert_with(|| FlowPoint::new(name))
            .clone()
    }

    /// Look up a flow point by name
    pub fn flow_point(&self, name: &str) -> Result<Arc<FlowPoint>> {
        self.points
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Graph(format!("no flow point named '{}' in '{}'", name, self.name)))
    }

    pub fn flow_point_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.points.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Change the graph state and bring every attached sub-graph along
    pub fn set_state(&self, target: RunState) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, target)
        };
        if previous != target {
            info!("Graph '{}' {} -> {}", self.name, previous, target);
        }

        let children: Vec<_> = self.children.lock().values().cloned().collect();
        for child in children {
            if let Err(e) = child.set_state(target) {
                warn!("Sub-graph '{}' failed to follow graph state: {}", child.name(), e);
            }
        }
        Ok(())
    }

    /// Add a sub-graph; names are unique within the graph
    pub fn add(&self, sub: Arc<dyn TransientSubGraph>) -> Result<()> {
        let mut children = self.children.lock();
        if children.contains_key(sub.name()) {
            return Err(AppError::Graph(format!(
                "sub-graph '{}' already exists in '{}'",
                sub.name(),
                self.name
            )));
        }
        debug!("Added sub-graph '{}' to '{}'", sub.name(), self.name);
        children.insert(sub.name().to_string(), sub);
        Ok(())
    }

    /// Remove a sub-graph by name; its run state is left untouched
    pub fn remove(&self, name: &str) -> Option<Arc<dyn TransientSubGraph>> {
        let removed = self.children.lock().remove(name);
        if removed.is_some() {
            debug!("Removed sub-graph '{}' from '{}'", name, self.name);
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.lock().contains_key(name)
    }

    pub fn sub_graph_count(&self) -> usize {
        self.children.lock().len()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut flow_points: Vec<FlowPointSnapshot> = self
            .points
            .read()
            .values()
            .map(|p| FlowPointSnapshot {
                name: p.name().to_string(),
                caps: p.caps().map(|c| c.to_string()),
                consumers: p.consumer_names(),
                probes: p.probe_count(),
                samples_pushed: p.samples_pushed(),
            })
            .collect();
        flow_points.sort_by(|a, b| a.name.cmp(&b.name));

        let mut sub_graphs: Vec<SubGraphSnapshot> = self
            .children
            .lock()
            .values()
            .map(|c| SubGraphSnapshot {
                name: c.name().to_string(),
                state: c.state(),
                description: c.describe(),
            })
            .collect();
        sub_graphs.sort_by(|a, b| a.name.cmp(&b.name));

        GraphSnapshot {
            name: self.name.clone(),
            state: self.state(),
            flow_points,
            sub_graphs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_points_are_unique() {
        let graph = LiveGraph::new("main");
        let a = graph.add_flow_point("appsink_0");
        let b = graph.add_flow_point("appsink_0");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(graph.flow_point("missing").is_err());
        assert_eq!(graph.flow_point_names(), vec!["appsink_0".to_string()]);
    }

    #[test]
    fn test_add_remove_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LiveGraph::new("main");
        graph.add_flow_point("appsink_0");
        graph.set_state(RunState::Playing).unwrap();

        let sub = SubGraphSpec::new("recording_0")
            .caps(Some(Caps::new("image/jpeg", 320, 240, 30)))
            .stage(StageSpec::FileSink { location: dir.path().join("x.mjpeg") })
            .build()
            .unwrap();
        graph.add(sub.clone()).unwrap();
        assert!(graph.add(sub.clone()).is_err());

        sub.sync_state_with_parent(&graph).unwrap();
        let snap = graph.snapshot();
        assert_eq!(snap.state, RunState::Playing);
        assert_eq!(snap.sub_graphs.len(), 1);
        assert_eq!(snap.sub_graphs[0].state, RunState::Playing);

        let removed = graph.remove("recording_0").unwrap();
        removed.set_state(RunState::Null).unwrap();
        assert!(!graph.contains("recording_0"));
        assert!(graph.remove("recording_0").is_none());
    }
}
