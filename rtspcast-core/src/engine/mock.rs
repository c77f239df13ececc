// In-memory media engine for testing without a media server
//
// Records every call, lets tests inject failures and delays per operation,
// and emits element events on demand.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    EngineConnector, EngineError, EngineResult, EventKind, MediaElement, MediaEngine, MediaEvent,
    MediaPipeline, PlayerOptions, Subscription,
};
use crate::types::IceCandidate;

/// Operations that can be made to fail or stall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    CreatePipeline,
    CreatePlayer,
    CreateWebRtcEndpoint,
    Play,
    Stop,
    Release,
    ReleasePipeline,
    ConnectSink,
    ProcessOffer,
    AddIceCandidate,
    GatherCandidates,
    GetPosition,
    Subscribe,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Always,
    Times(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockElementKind {
    Player,
    WebRtc,
}

#[derive(Default)]
struct Shared {
    faults: Mutex<HashMap<MockOp, Fault>>,
    delays: Mutex<HashMap<MockOp, Duration>>,
    released: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    player_position: AtomicI64,
}

impl Shared {
    async fn enter(&self, op: MockOp) -> EngineResult<()> {
        let delay = self.delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = self.faults.lock();
        match faults.get(&op).copied() {
            Some(Fault::Always) => Err(injected(op)),
            Some(Fault::Times(n)) => {
                if n <= 1 {
                    faults.remove(&op);
                } else {
                    faults.insert(op, Fault::Times(n - 1));
                }
                Err(injected(op))
            }
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn is_released(&self, id: &str) -> bool {
        self.released.lock().contains(id)
    }
}

fn injected(op: MockOp) -> EngineError {
    EngineError::Rpc {
        code: -1,
        message: format!("injected failure: {op:?}"),
    }
}

fn object_not_found(id: &str) -> EngineError {
    EngineError::Rpc {
        code: 40101,
        message: format!("Object '{id}' not found"),
    }
}

/// Mock engine shared by a [`MockConnector`] and the test body
pub struct MockEngine {
    shared: Arc<Shared>,
    pipelines: Mutex<Vec<Arc<MockPipeline>>>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shared = Shared::default();
        shared.player_position.store(1_000, Ordering::Relaxed);
        Arc::new(Self {
            shared: Arc::new(shared),
            pipelines: Mutex::new(Vec::new()),
        })
    }

    /// Make every future call of `op` fail
    pub fn fail(&self, op: MockOp) {
        self.shared.faults.lock().insert(op, Fault::Always);
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_times(&self, op: MockOp, times: usize) {
        if times > 0 {
            self.shared.faults.lock().insert(op, Fault::Times(times));
        }
    }

    pub fn recover(&self, op: MockOp) {
        self.shared.faults.lock().remove(&op);
    }

    /// Stall every call of `op` for `delay` before it runs
    pub fn delay(&self, op: MockOp, delay: Duration) {
        self.shared.delays.lock().insert(op, delay);
    }

    /// Position reported by players created from now on
    pub fn set_player_position(&self, position: i64) {
        self.shared.player_position.store(position, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pipelines(&self) -> Vec<Arc<MockPipeline>> {
        self.pipelines.lock().clone()
    }

    #[must_use]
    pub fn players(&self) -> Vec<Arc<MockElement>> {
        self.elements_of(MockElementKind::Player)
    }

    #[must_use]
    pub fn webrtc_endpoints(&self) -> Vec<Arc<MockElement>> {
        self.elements_of(MockElementKind::WebRtc)
    }

    fn elements_of(&self, kind: MockElementKind) -> Vec<Arc<MockElement>> {
        self.pipelines
            .lock()
            .iter()
            .flat_map(|p| p.elements.lock().clone())
            .filter(|e| e.kind == kind)
            .collect()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_pipeline(&self) -> EngineResult<Arc<dyn MediaPipeline>> {
        self.shared.enter(MockOp::CreatePipeline).await?;
        let pipeline = Arc::new(MockPipeline {
            id: self.shared.next_id("pipeline"),
            shared: Arc::clone(&self.shared),
            elements: Mutex::new(Vec::new()),
        });
        self.pipelines.lock().push(Arc::clone(&pipeline));
        Ok(pipeline)
    }
}

/// Connector handing out one shared [`MockEngine`]
pub struct MockConnector {
    engine: Arc<MockEngine>,
    connects: AtomicU64,
}

impl MockConnector {
    #[must_use]
    pub fn new(engine: Arc<MockEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            connects: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EngineConnector for MockConnector {
    async fn connect(&self, address: &str) -> EngineResult<Arc<dyn MediaEngine>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.engine
            .shared
            .enter(MockOp::Connect)
            .await
            .map_err(|e| EngineError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::clone(&self.engine) as Arc<dyn MediaEngine>)
    }
}

pub struct MockPipeline {
    id: String,
    shared: Arc<Shared>,
    elements: Mutex<Vec<Arc<MockElement>>>,
}

impl MockPipeline {
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.is_released(&self.id)
    }

    fn add(&self, kind: MockElementKind, options: Option<PlayerOptions>) -> Arc<MockElement> {
        let prefix = match kind {
            MockElementKind::Player => "player",
            MockElementKind::WebRtc => "webrtc",
        };
        let element = Arc::new(MockElement {
            id: self.shared.next_id(prefix),
            kind,
            options,
            shared: Arc::clone(&self.shared),
            playing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            gathering: AtomicBool::new(false),
            position: AtomicI64::new(self.shared.player_position.load(Ordering::Relaxed)),
            sinks: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        });
        self.elements.lock().push(Arc::clone(&element));
        element
    }
}

#[async_trait]
impl MediaPipeline for MockPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_player(&self, options: &PlayerOptions) -> EngineResult<Arc<dyn MediaElement>> {
        self.shared.enter(MockOp::CreatePlayer).await?;
        if self.is_released() {
            return Err(object_not_found(&self.id));
        }
        Ok(self.add(MockElementKind::Player, Some(options.clone())))
    }

    async fn create_webrtc_endpoint(&self) -> EngineResult<Arc<dyn MediaElement>> {
        self.shared.enter(MockOp::CreateWebRtcEndpoint).await?;
        if self.is_released() {
            return Err(object_not_found(&self.id));
        }
        Ok(self.add(MockElementKind::WebRtc, None))
    }

    async fn release(&self) -> EngineResult<()> {
        self.shared.enter(MockOp::ReleasePipeline).await?;
        let mut released = self.shared.released.lock();
        released.insert(self.id.clone());
        for element in self.elements.lock().iter() {
            released.insert(element.id.clone());
            element.subscribers.lock().clear();
        }
        Ok(())
    }
}

pub struct MockElement {
    id: String,
    kind: MockElementKind,
    options: Option<PlayerOptions>,
    shared: Arc<Shared>,
    playing: AtomicBool,
    stopped: AtomicBool,
    gathering: AtomicBool,
    position: AtomicI64,
    sinks: Mutex<Vec<String>>,
    offers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    subscribers: Mutex<Vec<(EventKind, mpsc::UnboundedSender<MediaEvent>)>>,
}

impl MockElement {
    #[must_use]
    pub const fn kind(&self) -> MockElementKind {
        self.kind
    }

    #[must_use]
    pub const fn options(&self) -> Option<&PlayerOptions> {
        self.options.as_ref()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.is_released(&self.id)
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_gathering(&self) -> bool {
        self.gathering.load(Ordering::Relaxed)
    }

    /// Ids of the sinks this element was connected to, in call order
    #[must_use]
    pub fn sinks(&self) -> Vec<String> {
        self.sinks.lock().clone()
    }

    #[must_use]
    pub fn offers(&self) -> Vec<String> {
        self.offers.lock().clone()
    }

    /// Candidates applied to this element, in application order
    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn set_position(&self, position: i64) {
        self.position.store(position, Ordering::Relaxed);
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|(k, tx)| *k == kind && !tx.is_closed())
            .count()
    }

    /// Raise an event, returning how many live subscribers received it
    pub fn emit(&self, event: MediaEvent) -> usize {
        let kind = match event {
            MediaEvent::EndOfStream => EventKind::EndOfStream,
            MediaEvent::IceCandidate(_) => EventKind::IceCandidate,
        };
        let mut delivered = 0;
        self.subscribers.lock().retain(|(k, tx)| {
            if *k != kind {
                return !tx.is_closed();
            }
            let ok = tx.send(event.clone()).is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        delivered
    }

    async fn enter(&self, op: MockOp) -> EngineResult<()> {
        self.shared.enter(op).await?;
        if self.is_released() {
            return Err(object_not_found(&self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaElement for MockElement {
    fn id(&self) -> &str {
        &self.id
    }

    async fn play(&self) -> EngineResult<()> {
        self.enter(MockOp::Play).await?;
        self.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.enter(MockOp::Stop).await?;
        self.playing.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn release(&self) -> EngineResult<()> {
        self.enter(MockOp::Release).await?;
        self.shared.released.lock().insert(self.id.clone());
        self.subscribers.lock().clear();
        Ok(())
    }

    async fn connect(&self, sink: &dyn MediaElement) -> EngineResult<()> {
        self.enter(MockOp::ConnectSink).await?;
        if self.shared.is_released(sink.id()) {
            return Err(object_not_found(sink.id()));
        }
        self.sinks.lock().push(sink.id().to_string());
        Ok(())
    }

    async fn process_offer(&self, offer: &str) -> EngineResult<String> {
        self.enter(MockOp::ProcessOffer).await?;
        self.offers.lock().push(offer.to_string());
        Ok(format!("answer-from-{}", self.id))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> EngineResult<()> {
        self.enter(MockOp::AddIceCandidate).await?;
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn gather_candidates(&self) -> EngineResult<()> {
        self.enter(MockOp::GatherCandidates).await?;
        self.gathering.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn get_position(&self) -> EngineResult<i64> {
        self.enter(MockOp::GetPosition).await?;
        Ok(self.position.load(Ordering::Relaxed))
    }

    async fn subscribe(&self, kind: EventKind) -> EngineResult<Subscription> {
        self.enter(MockOp::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((kind, tx));
        Ok(Subscription::new(self.shared.next_id("subscription"), rx))
    }
}
