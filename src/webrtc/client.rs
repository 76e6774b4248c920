//! Signaling client
//!
//! ```text
//! disconnected ──open──> connecting ──SESSION_OK──> negotiating ──answer──> connected
//!                            │                           │                     │
//!                            └──────── ERROR / protocol violation / socket error ──> error
//! ```
//!
//! `open` connects (with bounded retries), says `HELLO` and hands the socket
//! to an event-loop task. On `SESSION_OK` the loop creates a peer, attaches
//! the streaming sub-graph at the distribution point, and sends the offer.
//! Leaving the session for any reason detaches the sub-graph and closes the
//! peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::peer::{PeerEndpoint, PeerFactory};
use super::signaling::{ClientMessage, IceCandidate, ServerMessage, SignalingState};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::graph::{
    AttachHandle, GraphMutator, SpliceMode, StageSpec, SubGraphSpec, TransientSubGraph,
};
use crate::utils::retry_fixed;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Queue depth of the streaming sub-graph; a slow peer drops samples
const STREAM_QUEUE_CAPACITY: usize = 32;

/// Result of `open`
#[derive(Debug, Clone, Serialize)]
pub struct StartStreamResponse {
    pub status: SignalingState,
    pub peer_id: String,
    pub errors: Vec<String>,
}

/// Control-surface view of the signaling client
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: SignalingState,
    pub peer_id: Option<String>,
    pub attached: bool,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub remote_candidates: usize,
    pub local_candidates: usize,
}

/// State of one peer negotiation; created by `open`, dropped on error/close
struct PeerSession {
    generation: u64,
    peer_id: String,
    peer: Option<Arc<dyn PeerEndpoint>>,
    attach: Option<AttachHandle>,
    sub_graph: Option<Arc<dyn TransientSubGraph>>,
    local_description: Option<String>,
    remote_description: Option<String>,
    ice_candidates: Vec<IceCandidate>,
    local_candidates: usize,
}

struct ClientShared {
    config: SignalingConfig,
    mutator: GraphMutator,
    events: Arc<EventBus>,
    factory: Arc<dyn PeerFactory>,
    state_tx: watch::Sender<SignalingState>,
    session: Mutex<Option<PeerSession>>,
    task: SyncMutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    /// Held across a whole `open` or `close`
    open_lock: Mutex<()>,
}

/// WebRTC signaling client attaching one streaming peer at a time
pub struct SignalingClient {
    shared: Arc<ClientShared>,
}

impl SignalingClient {
    pub fn new(
        config: SignalingConfig,
        mutator: GraphMutator,
        events: Arc<EventBus>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SignalingState::Disconnected);
        Self {
            shared: Arc::new(ClientShared {
                config,
                mutator,
                events,
                factory,
                state_tx,
                session: Mutex::new(None),
                task: SyncMutex::new(None),
                generation: AtomicU64::new(0),
                open_lock: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> SignalingState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn status(&self) -> StreamStatus {
        let session = self.shared.session.lock().await;
        let s = session.as_ref();
        StreamStatus {
            state: self.state(),
            peer_id: s.map(|s| s.peer_id.clone()),
            attached: s.map(|s| s.sub_graph.is_some()).unwrap_or(false),
            has_local_description: s.map(|s| s.local_description.is_some()).unwrap_or(false),
            has_remote_description: s.map(|s| s.remote_description.is_some()).unwrap_or(false),
            remote_candidates: s.map(|s| s.ice_candidates.len()).unwrap_or(0),
            local_candidates: s.map(|s| s.local_candidates).unwrap_or(0),
        }
    }

    /// Connect to the signaling server and start negotiating with `peer_id`
    ///
    /// An existing session is closed first. Connect failures are retried;
    /// when every attempt fails all errors are returned in order. Concurrent
    /// calls run one after the other; the last one owns the session.
    pub async fn open(&self, peer_id: &str) -> StartStreamResponse {
        let _open = self.shared.open_lock.lock().await;
        self.close_locked().await;

        let shared = &self.shared;
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.set_state(SignalingState::Connecting, Some(peer_id), None);

        let url = shared.config.server_url.clone();
        let attempts = shared.config.connect_attempts;
        let delay = Duration::from_millis(shared.config.retry_delay_ms);
        let connected = retry_fixed(attempts, delay, |attempt| {
            let url = url.clone();
            async move {
                debug!("Connecting to {} (attempt {}/{})", url, attempt, attempts);
                connect_async(url.as_str())
                    .await
                    .map(|(ws, _)| ws)
                    .map_err(|e| AppError::ConnectionFailure {
                        endpoint: url.clone(),
                        reason: e.to_string(),
                    })
            }
        })
        .await;

        let ws = match connected {
            Ok(ws) => ws,
            Err(errors) => {
                let errors: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                error!("Signaling connect to {} failed {} times", url, errors.len());
                shared.set_state(
                    SignalingState::Error,
                    Some(peer_id),
                    errors.last().cloned(),
                );
                return StartStreamResponse {
                    status: SignalingState::Error,
                    peer_id: peer_id.to_string(),
                    errors,
                };
            }
        };

        let (mut write, read) = ws.split();
        let hello = ClientMessage::Hello(shared.config.client_id);
        if let Err(e) = send_frame(&mut write, &hello).await {
            shared.set_state(SignalingState::Error, Some(peer_id), Some(e.to_string()));
            return StartStreamResponse {
                status: SignalingState::Error,
                peer_id: peer_id.to_string(),
                errors: vec![e.to_string()],
            };
        }

        *shared.session.lock().await = Some(PeerSession {
            generation,
            peer_id: peer_id.to_string(),
            peer: None,
            attach: None,
            sub_graph: None,
            local_description: None,
            remote_description: None,
            ice_candidates: Vec::new(),
            local_candidates: 0,
        });

        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            shared: shared.clone(),
            generation,
            peer_id: peer_id.to_string(),
            write,
            ice_tx,
        };
        let task = tokio::spawn(event_loop.run(read, ice_rx));
        if let Some(previous) = shared.task.lock().replace(task) {
            previous.abort();
        }

        info!("Signaling session with peer {} opened", peer_id);
        StartStreamResponse {
            status: self.state(),
            peer_id: peer_id.to_string(),
            errors: Vec::new(),
        }
    }

    /// Stop the event loop, detach the streaming sub-graph, close the peer
    pub async fn close(&self) {
        let _open = self.shared.open_lock.lock().await;
        self.close_locked().await;
    }

    async fn close_locked(&self) {
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let generation = self.shared.session.lock().await.as_ref().map(|s| s.generation);
        if let Some(generation) = generation {
            self.shared
                .clone()
                .teardown(generation, SignalingState::Disconnected, None)
                .await;
        }
    }
}

impl ClientShared {
    fn set_state(&self, state: SignalingState, peer_id: Option<&str>, reason: Option<String>) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Signaling {} -> {}", previous, state);
        }
        self.events.publish(SystemEvent::SignalingStateChanged {
            state: state.to_string(),
            peer_id: peer_id.map(str::to_string),
            reason,
        });
    }

    /// Release the session of `generation`, if it is still the current one
    async fn teardown(self: Arc<Self>, generation: u64, state: SignalingState, reason: Option<String>) {
        let session = {
            let mut guard = self.session.lock().await;
            match guard.as_ref() {
                Some(s) if s.generation == generation => guard.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };

        if let Some(handle) = session.attach {
            handle.withdraw();
        }
        if let Some(sub) = session.sub_graph {
            let mutator = self.mutator.clone();
            let point = mutator.graph().flow_point(&self.config.distribution_point).ok();
            let detached = tokio::task::spawn_blocking(move || {
                mutator.detach(sub, point, |result| {
                    if let Err(e) = result {
                        warn!("Streaming sub-graph disposal failed: {}", e);
                    }
                })
            })
            .await;
            match detached {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Streaming detach: {}", e),
                Err(e) => warn!("Streaming detach task failed: {}", e),
            }
        }
        if let Some(peer) = session.peer {
            if let Err(e) = peer.close().await {
                warn!("Closing peer {}: {}", session.peer_id, e);
            }
        }

        self.set_state(state, Some(&session.peer_id), reason);
    }
}

async fn send_frame(write: &mut SplitSink<WsStream, Message>, message: &ClientMessage) -> Result<()> {
    let text = message.to_text()?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| AppError::Signaling(format!("send failed: {}", e)))
}

/// Socket owner for one session
struct EventLoop {
    shared: Arc<ClientShared>,
    generation: u64,
    peer_id: String,
    write: SplitSink<WsStream, Message>,
    ice_tx: mpsc::UnboundedSender<IceCandidate>,
}

impl EventLoop {
    /// Apply `f` to the session, unless a newer `open` replaced it
    async fn with_session<R>(&self, f: impl FnOnce(&mut PeerSession) -> R) -> Option<R> {
        let mut session = self.shared.session.lock().await;
        session
            .as_mut()
            .filter(|s| s.generation == self.generation)
            .map(f)
    }

    fn superseded(&self) -> AppError {
        AppError::Signaling(format!(
            "session {} with peer {} was superseded",
            self.generation, self.peer_id
        ))
    }

    async fn run(mut self, mut read: SplitStream<WsStream>, mut ice_rx: mpsc::UnboundedReceiver<IceCandidate>) {
        let outcome: Result<()> = loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle(&text).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        break Err(AppError::ProtocolViolation("unexpected binary frame".to_string()));
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(AppError::Signaling(format!("socket error: {}", e))),
                },
                Some(candidate) = ice_rx.recv() => {
                    self.note_local_candidate().await;
                    if let Err(e) = send_frame(&mut self.write, &ClientMessage::Ice(candidate)).await {
                        break Err(e);
                    }
                }
            }
        };

        let _ = self.write.close().await;
        let (state, reason) = match outcome {
            Ok(()) => {
                info!("Signaling socket for peer {} closed", self.peer_id);
                (SignalingState::Disconnected, None)
            }
            Err(e) => {
                error!("Signaling session with peer {} failed: {}", self.peer_id, e);
                (SignalingState::Error, Some(e.to_string()))
            }
        };
        // Runs to completion even if this task is aborted meanwhile
        let shared = self.shared.clone();
        let generation = self.generation;
        let _ = tokio::spawn(shared.teardown(generation, state, reason)).await;
    }

    async fn handle(&mut self, text: &str) -> Result<()> {
        match ServerMessage::parse(text)? {
            ServerMessage::Hello => {
                debug!("Server greeted us, requesting session with {}", self.peer_id);
                send_frame(&mut self.write, &ClientMessage::Session(self.peer_id.clone())).await
            }
            ServerMessage::SessionOk => self.negotiate().await,
            ServerMessage::Error(reason) => Err(AppError::Signaling(format!("server error: {}", reason))),
            ServerMessage::Answer(sdp) => {
                let peer = self.peer().await?;
                peer.set_remote_answer(sdp.clone()).await?;
                self.with_session(|s| s.remote_description = Some(sdp))
                    .await
                    .ok_or_else(|| self.superseded())?;
                self.shared
                    .set_state(SignalingState::Connected, Some(&self.peer_id), None);
                Ok(())
            }
            ServerMessage::Ice(candidate) => {
                let peer = self.peer().await?;
                peer.add_ice_candidate(candidate.clone()).await?;
                self.with_session(|s| s.ice_candidates.push(candidate))
                    .await
                    .ok_or_else(|| self.superseded())
            }
        }
    }

    async fn peer(&self) -> Result<Arc<dyn PeerEndpoint>> {
        self.with_session(|s| s.peer.clone())
            .await
            .ok_or_else(|| self.superseded())?
            .ok_or_else(|| AppError::ProtocolViolation("negotiation message before SESSION_OK".to_string()))
    }

    async fn note_local_candidate(&self) {
        self.with_session(|s| s.local_candidates += 1).await;
    }

    async fn negotiate(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        match self.with_session(|s| s.peer.is_some()).await {
            None => return Err(self.superseded()),
            Some(true) => return Err(AppError::ProtocolViolation("duplicate SESSION_OK".to_string())),
            Some(false) => {}
        }
        shared.set_state(SignalingState::Negotiating, Some(&self.peer_id), None);

        let peer = shared.factory.create(self.ice_tx.clone()).await?;
        if self.with_session(|s| s.peer = Some(peer.clone())).await.is_none() {
            if let Err(e) = peer.close().await {
                warn!("Closing peer {}: {}", self.peer_id, e);
            }
            return Err(self.superseded());
        }

        let mutator = shared.mutator.clone();
        let point = mutator.graph().flow_point(&shared.config.distribution_point)?;
        let sink = peer.media_sink();
        let name = format!("streaming_{}", self.peer_id);
        let (tx, rx) = oneshot::channel();

        let orphan_mutator = mutator.clone();
        let orphan_point = point.clone();
        let handle = mutator.attach(
            &point,
            SpliceMode::LinkToPoint,
            move |_, caps| {
                let sub = SubGraphSpec::new(name)
                    .caps(caps)
                    .stage(StageSpec::Queue {
                        capacity: STREAM_QUEUE_CAPACITY,
                    })
                    .stage(StageSpec::Sink(sink))
                    .build()?;
                Ok(sub as Arc<dyn TransientSubGraph>)
            },
            move |result| {
                // Nobody is waiting any more: take the sub-graph back out
                if let Err(Ok(sub)) = tx.send(result) {
                    warn!("Streaming sub-graph '{}' attached after its session ended", sub.name());
                    let mutator = orphan_mutator.clone();
                    orphan_mutator.scheduler().defer("detach-orphan", move || {
                        let _ = mutator.detach(sub, Some(orphan_point), |_| {});
                    });
                }
            },
        );
        let mut pending = Some(handle);
        self.with_session(|s| s.attach = pending.take()).await;
        if let Some(handle) = pending {
            handle.withdraw();
            return Err(self.superseded());
        }

        let timeout = Duration::from_millis(shared.config.attach_timeout_ms);
        let attached = tokio::time::timeout(timeout, rx).await;
        let attach = self.with_session(|s| s.attach.take()).await.flatten();
        let sub = match attached {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(AppError::Internal("attach callback dropped".to_string()));
            }
            Err(_) => {
                if let Some(handle) = attach {
                    handle.withdraw();
                }
                return Err(AppError::Timeout(format!(
                    "streaming sub-graph not attached at '{}' within {:?}",
                    shared.config.distribution_point, timeout
                )));
            }
        };
        let mut pending = Some(sub);
        self.with_session(|s| s.sub_graph = pending.take()).await;
        if let Some(sub) = pending {
            // Teardown already ran for this session, so nobody else owns the sub-graph
            let detached = tokio::task::spawn_blocking(move || mutator.detach(sub, Some(point), |_| {})).await;
            if let Ok(Err(e)) = detached {
                warn!("Streaming detach: {}", e);
            }
            return Err(self.superseded());
        }

        let offer = peer.create_offer().await?;
        self.with_session(|s| s.local_description = Some(offer.clone()))
            .await
            .ok_or_else(|| self.superseded())?;
        send_frame(&mut self.write, &ClientMessage::Offer(offer)).await?;
        info!("Offer sent to peer {}", self.peer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Caps, FlowPoint, LiveGraph, MediaSink, RunState, Sample};
    use crate::utils::Scheduler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct FakePeer {
        answer: SyncMutex<Option<String>>,
        candidates: SyncMutex<Vec<IceCandidate>>,
        offers: AtomicU64,
        closed: AtomicBool,
        written: Arc<AtomicU64>,
    }

    struct CountingSink(Arc<AtomicU64>);

    impl MediaSink for CountingSink {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn write(&mut self, _sample: &Sample) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl PeerEndpoint for FakePeer {
        async fn create_offer(&self) -> Result<String> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            Ok("v=0 fake-offer".to_string())
        }

        async fn set_remote_answer(&self, sdp: String) -> Result<()> {
            *self.answer.lock() = Some(sdp);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        fn media_sink(&self) -> Box<dyn MediaSink> {
            Box::new(CountingSink(self.written.clone()))
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory(Arc<FakePeer>);

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(&self, _ice_tx: mpsc::UnboundedSender<IceCandidate>) -> Result<Arc<dyn PeerEndpoint>> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        client: SignalingClient,
        graph: Arc<LiveGraph>,
        point: Arc<FlowPoint>,
        peer: Arc<FakePeer>,
        feeding: Arc<AtomicBool>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.feeding.store(false, Ordering::SeqCst);
        }
    }

    fn fixture(server_url: String, attempts: u32) -> Fixture {
        let graph = LiveGraph::new("main");
        let point = graph.add_flow_point("connection");
        point.set_caps(Caps::new("video/x-vp8", 320, 240, 50));
        graph.set_state(RunState::Playing).unwrap();

        let feeding = Arc::new(AtomicBool::new(true));
        {
            let point = point.clone();
            let feeding = feeding.clone();
            std::thread::spawn(move || {
                let mut seq = 0u64;
                while feeding.load(Ordering::SeqCst) {
                    point.push(Sample::new(vec![1u8; 8], Duration::ZERO, Duration::from_millis(20), seq));
                    seq += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        }

        let config = SignalingConfig {
            server_url,
            client_id: 105,
            connect_attempts: attempts,
            retry_delay_ms: 1,
            attach_timeout_ms: 2000,
            ..Default::default()
        };
        let peer = Arc::new(FakePeer::default());
        let client = SignalingClient::new(
            config,
            GraphMutator::new(graph.clone(), Scheduler::current()),
            Arc::new(EventBus::new()),
            Arc::new(FakeFactory(peer.clone())),
        );
        Fixture {
            client,
            graph,
            point,
            peer,
            feeding,
        }
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return Some(text.to_string());
            }
        }
        None
    }

    async fn wait_state(client: &SignalingClient, state: SignalingState) -> bool {
        let mut rx = client.subscribe_state();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_offer_sent_before_answer_and_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            assert_eq!(next_text(&mut ws).await.as_deref(), Some("HELLO 105"));
            ws.send(Message::Text("HELLO".into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await.as_deref(), Some("SESSION 7"));
            ws.send(Message::Text("SESSION_OK".into())).await.unwrap();

            // The offer must arrive without us sending anything first
            let offer = next_text(&mut ws).await.unwrap();
            ws.send(Message::Text(r#"{"sdp": {"type": "answer", "sdp": "v=0 answer"}}"#.into()))
                .await
                .unwrap();
            for (candidate, index) in [("candidate:0", 0), ("candidate:1", 1), ("candidate:2", 0)] {
                let frame = format!(r#"{{"ice": {{"candidate": "{}", "sdpMLineIndex": {}}}}}"#, candidate, index);
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
            offer
        });

        let f = fixture(format!("ws://{}", addr), 3);
        let response = f.client.open("7").await;
        assert!(response.errors.is_empty());
        assert_eq!(response.peer_id, "7");

        assert!(wait_state(&f.client, SignalingState::Connected).await);
        assert_eq!(f.peer.offers.load(Ordering::SeqCst), 1);
        assert_eq!(f.peer.answer.lock().as_deref(), Some("v=0 answer"));
        assert!(f.graph.contains("streaming_7"));
        assert!(f.point.is_linked("streaming_7"));

        // ICE is applied after the answer, in arrival order
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *f.peer.candidates.lock(),
            vec![
                IceCandidate::new("candidate:0", 0),
                IceCandidate::new("candidate:1", 1),
                IceCandidate::new("candidate:2", 0),
            ]
        );
        let status = f.client.status().await;
        assert!(status.attached && status.has_local_description && status.has_remote_description);
        assert_eq!(status.remote_candidates, 3);
        assert!(f.peer.written.load(Ordering::SeqCst) > 0);

        f.client.close().await;
        assert_eq!(f.client.state(), SignalingState::Disconnected);
        assert!(f.peer.closed.load(Ordering::SeqCst));
        assert!(!f.point.is_linked("streaming_7"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!f.graph.contains("streaming_7"));

        let offer = server.await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&offer).unwrap();
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(value["sdp"]["sdp"], "v=0 fake-offer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_failures_are_aggregated() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let f = fixture(format!("ws://{}", addr), 10);

        let response = f.client.open("7").await;
        assert_eq!(response.status, SignalingState::Error);
        assert_eq!(response.errors.len(), 10);
        assert!(response.errors.iter().all(|e| e.contains("Connection failed")));
        assert_eq!(f.client.state(), SignalingState::Error);
        assert_eq!(f.graph.sub_graph_count(), 0);
        assert_eq!(f.point.probe_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_error_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            next_text(&mut ws).await;
            ws.send(Message::Text("HELLO".into())).await.unwrap();
            next_text(&mut ws).await;
            ws.send(Message::Text("ERROR peer 7 not found".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let f = fixture(format!("ws://{}", addr), 1);
        f.client.open("7").await;
        assert!(wait_state(&f.client, SignalingState::Error).await);
        assert_eq!(f.graph.sub_graph_count(), 0);
        assert_eq!(f.peer.offers.load(Ordering::SeqCst), 0);
        assert!(f.client.status().await.peer_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unexpected_frame_is_protocol_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            next_text(&mut ws).await;
            ws.send(Message::Text("WHO ARE YOU".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let f = fixture(format!("ws://{}", addr), 1);
        let mut events = f.client.shared.events.subscribe();
        f.client.open("7").await;
        assert!(wait_state(&f.client, SignalingState::Error).await);

        let mut reason = None;
        while let Ok(SystemEvent::SignalingStateChanged { state, reason: r, .. }) = events.try_recv() {
            if state == "error" {
                reason = r;
            }
        }
        assert!(reason.unwrap_or_default().contains("protocol violation"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_leave_no_loop_behind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ended = Arc::new(AtomicU64::new(0));
        {
            let ended = ended.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    let (stream, _) = listener.accept().await.unwrap();
                    let ended = ended.clone();
                    tokio::spawn(async move {
                        let mut ws = accept_async(stream).await.unwrap();
                        while let Some(Ok(_)) = ws.next().await {}
                        ended.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }

        let f = fixture(format!("ws://{}", addr), 1);
        let (a, b) = tokio::join!(f.client.open("7"), f.client.open("8"));
        assert!(a.errors.is_empty() && b.errors.is_empty());
        let owner = f.client.status().await.peer_id.unwrap();
        assert!(owner == "7" || owner == "8");

        f.client.close().await;
        assert_eq!(f.client.state(), SignalingState::Disconnected);
        assert!(f.client.status().await.peer_id.is_none());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while ended.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ended.load(Ordering::SeqCst), 2);
        assert_eq!(f.graph.sub_graph_count(), 0);
    }
}
