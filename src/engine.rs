//! Engine assembly
//!
//! [`build_engine`] wires the live graph, the recording sessions and the
//! signaling client from configuration without touching the filesystem or
//! the network. [`Engine::start`] is where the process starts producing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{AppConfig, SourceConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::graph::source::TEST_PATTERN_MEDIA_TYPE;
use crate::graph::{
    Caps, FlowPoint, GraphMutator, GraphSnapshot, LiveGraph, RunState, SampleConsumer,
    SyntheticSource, TeeBranch,
};
use crate::recorder::{MultiRecorder, RecordingSession, SessionSettings, SessionStatus};
use crate::utils::Scheduler;
use crate::webrtc::{RtcPeerFactory, SignalingClient, StartStreamResponse, StreamStatus};

/// Media type announced for externally fed sources
pub const EXTERNAL_MEDIA_TYPE: &str = "video/x-raw";

/// Registered source as reported by the control surface
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub flow_point: String,
    pub synthetic: bool,
    pub distributed: bool,
    pub samples_pushed: u64,
    pub recording: Option<SessionStatus>,
}

struct SourceEntry {
    config: SourceConfig,
    point: Arc<FlowPoint>,
    generator: Option<SyntheticSource>,
}

pub struct Engine {
    graph: Arc<LiveGraph>,
    recorder: Arc<MultiRecorder>,
    signaling: SignalingClient,
    events: Arc<EventBus>,
    sources: Vec<SourceEntry>,
    distribution: Arc<FlowPoint>,
    tee: Option<Arc<TeeBranch>>,
    tee_source: Option<usize>,
    output_dir: PathBuf,
    started: AtomicBool,
}

/// Build the engine for `config`; timers and deferred work run on `handle`
pub fn build_engine(config: &AppConfig, handle: Handle) -> Result<Engine> {
    let graph = LiveGraph::new("vigil");
    let scheduler = Scheduler::new(handle.clone());
    let mutator = GraphMutator::new(graph.clone(), scheduler);
    let events = Arc::new(EventBus::new());
    let recorder = Arc::new(MultiRecorder::new());
    let settings = SessionSettings::from(&config.recorder);

    let distribution = graph.add_flow_point(&config.signaling.distribution_point);
    let mut tee_source = None;
    let mut sources = Vec::with_capacity(config.sources.len());

    for (index, source) in config.sources.iter().enumerate() {
        let media_type = if source.synthetic {
            TEST_PATTERN_MEDIA_TYPE
        } else {
            EXTERNAL_MEDIA_TYPE
        };
        let caps = Caps::new(media_type, source.width, source.height, source.fps.max(1));
        let point = graph.add_flow_point(&source.sink_name());
        point.set_caps(caps.clone());

        if source.distribute {
            if tee_source.is_none() {
                distribution.set_caps(caps);
                tee_source = Some(index);
            } else {
                warn!(
                    "Source '{}' also asks for distribution; only one source feeds '{}'",
                    source.id,
                    distribution.name()
                );
            }
        }

        let session = RecordingSession::new(
            source.id.clone(),
            point.clone(),
            mutator.clone(),
            events.clone(),
            settings.clone(),
        );
        session.install()?;
        recorder.register(session);

        let generator = source.synthetic.then(|| {
            SyntheticSource::new(source.id.clone(), point.clone(), source.fps, source.width, source.height)
        });
        sources.push(SourceEntry {
            config: source.clone(),
            point,
            generator,
        });
    }

    let factory = Arc::new(RtcPeerFactory::new(&config.signaling, handle));
    let signaling = SignalingClient::new(config.signaling.clone(), mutator, events.clone(), factory);

    info!(
        "Engine built: {} source(s), distribution point '{}'",
        sources.len(),
        distribution.name()
    );
    Ok(Engine {
        graph,
        recorder,
        signaling,
        events,
        sources,
        tee: tee_source.map(|_| TeeBranch::new(distribution.clone())),
        distribution,
        tee_source,
        output_dir: PathBuf::from(&config.recorder.output_dir),
        started: AtomicBool::new(false),
    })
}

impl Engine {
    /// Create the clip directory, set the graph to Playing and start sources
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.output_dir)?;
        self.graph.set_state(RunState::Playing)?;

        if let (Some(index), Some(tee)) = (self.tee_source, &self.tee) {
            self.sources[index].point.link(tee.clone())?;
        }
        for source in &self.sources {
            if let Some(generator) = &source.generator {
                generator.start()?;
            }
        }
        info!("Engine started, clips go to {}", self.output_dir.display());
        Ok(())
    }

    /// Close streaming, finish open clips, stop sources and bring the graph to Null
    ///
    /// Blocks on data-flow threads; call from a blocking context.
    pub fn shutdown(&self, handle: &Handle) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        handle.block_on(self.signaling.close());
        self.recorder.shutdown();
        for source in &self.sources {
            if let Some(generator) = &source.generator {
                generator.stop();
            }
        }
        if let (Some(index), Some(tee)) = (self.tee_source, &self.tee) {
            self.sources[index].point.unlink(tee.name());
        }
        if let Err(e) = self.graph.set_state(RunState::Null) {
            warn!("Failed to stop graph: {}", e);
        }
        info!("Engine stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Trigger a clip on `source_id`; blocks while a previous start settles
    pub fn record(&self, source_id: &str) -> Result<PathBuf> {
        self.recorder.record(source_id)
    }

    pub async fn start_stream(&self, peer_id: &str) -> StartStreamResponse {
        self.signaling.open(peer_id).await
    }

    pub async fn stop_stream(&self) {
        self.signaling.close().await
    }

    pub async fn stream_status(&self) -> StreamStatus {
        self.signaling.status().await
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, source)| SourceInfo {
                id: source.config.id.clone(),
                flow_point: source.point.name().to_string(),
                synthetic: source.config.synthetic,
                distributed: self.tee_source == Some(index),
                samples_pushed: source.point.samples_pushed(),
                recording: self
                    .recorder
                    .session(&source.config.id)
                    .ok()
                    .map(|s| s.status()),
            })
            .collect()
    }

    /// Flow point of `source_id`, for feeding externally produced samples
    pub fn source_point(&self, source_id: &str) -> Option<Arc<FlowPoint>> {
        self.sources
            .iter()
            .find(|s| s.config.id == source_id)
            .map(|s| s.point.clone())
    }

    pub fn distribution_point(&self) -> &Arc<FlowPoint> {
        &self.distribution
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    pub fn graph(&self) -> &Arc<LiveGraph> {
        &self.graph
    }

    pub fn recorder(&self) -> &Arc<MultiRecorder> {
        &self.recorder
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::events::SystemEvent;
    use crate::webrtc::SignalingState;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(output_dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.recorder.output_dir = output_dir.join("clips").to_string_lossy().to_string();
        config.recorder.window_secs = 1;
        config.sources = vec![
            SourceConfig::default(),
            SourceConfig {
                id: "1".to_string(),
                distribute: false,
                ..Default::default()
            },
        ];
        // Nothing listens on port 1
        config.signaling.server_url = "ws://127.0.0.1:1".to_string();
        config.signaling.connect_attempts = 2;
        config.signaling.retry_delay_ms = 1;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_build_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let engine = build_engine(&test_config(dir.path()), Handle::current()).unwrap();

        assert!(!dir.path().join("clips").exists());
        assert!(!engine.is_started());
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, RunState::Null);
        let names: Vec<_> = snapshot.flow_points.iter().map(|p| p.name.clone()).collect();
        assert!(names.contains(&"appsink_0".to_string()));
        assert!(names.contains(&"appsink_1".to_string()));
        assert!(names.contains(&"connection".to_string()));
        assert_eq!(engine.recorder().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_clip_end_to_end() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(build_engine(&test_config(dir.path()), Handle::current()).unwrap());
        let mut events = engine.events().subscribe();
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let e = engine.clone();
        let path = tokio::task::spawn_blocking(move || e.record("0")).await.unwrap().unwrap();
        assert!(path.ends_with("event_0_0.mjpeg"));

        let e = engine.clone();
        let unknown = tokio::task::spawn_blocking(move || e.record("nope")).await.unwrap();
        assert!(matches!(unknown, Err(AppError::UnknownSource(_))));

        let completed = tokio::time::timeout(Duration::from_secs(6), async {
            loop {
                if let Ok(SystemEvent::ClipCompleted { path, .. }) = events.recv().await {
                    return path;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(PathBuf::from(&completed), path);

        let data = std::fs::read(&path).unwrap();
        assert!(!data.is_empty());
        assert_eq!(&data[..4], b"VGL0");

        // The distributed source reaches the distribution point, the other does not
        let sources = engine.sources();
        assert!(sources[0].distributed && !sources[1].distributed);
        assert!(engine.distribution_point().samples_pushed() > 0);

        let e = engine.clone();
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || e.shutdown(&handle)).await.unwrap();
        assert_eq!(engine.snapshot().state, RunState::Null);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stream_start_unreachable_server() {
        let dir = tempdir().unwrap();
        let engine = build_engine(&test_config(dir.path()), Handle::current()).unwrap();
        engine.start().unwrap();

        let response = engine.start_stream("7").await;
        assert_eq!(response.status, SignalingState::Error);
        assert_eq!(response.errors.len(), 2);
        assert_eq!(engine.graph().sub_graph_count(), 0);
        assert_eq!(engine.distribution_point().probe_count(), 0);
    }
}
