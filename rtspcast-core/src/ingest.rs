//! Ingest lifecycle
//!
//! Owns the single live source feeding every viewer:
//!
//! ```text
//! Disconnected -> Connecting -> EstablishingPipeline -> Playing
//!                                                        |   ^
//!                                    end of stream/stall v   |
//!                                                   Reconnecting -> Failed
//! ```
//!
//! `Stopped` is entered from any state on shutdown and is terminal.
//!
//! Each ingest endpoint gets a generation number. A single supervisor task
//! watches the current generation and triggers at most one reconnect per
//! generation, and only while that generation is still the published one.

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::MediaConfig;
use crate::engine::{
    EngineConnector, EventKind, MediaElement, MediaEngine, MediaEvent, MediaPipeline, PlayerOptions,
    Subscription,
};
use crate::error::{Error, Result};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Disconnected,
    Connecting,
    EstablishingPipeline,
    Playing,
    Reconnecting,
    /// Reconnect attempts exhausted
    Failed,
    Stopped,
}

impl IngestState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::EstablishingPipeline => "establishing_pipeline",
            Self::Playing => "playing",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether viewers may join
    ///
    /// A reconnecting ingest still counts: joining viewers are bound to the
    /// replacement endpoint once it is published.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Playing | Self::Reconnecting)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry schedule for a failing reconnect cycle
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Total endpoint creation attempts per cycle
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delays between attempts; the first attempt runs immediately
    fn delays(&self) -> impl Iterator<Item = Duration> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
            .build();
        std::iter::once(Duration::ZERO).chain(backoff)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub engine_address: String,
    pub use_encoded_media: bool,
    pub network_cache: u32,
    pub probe_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl From<&MediaConfig> for IngestSettings {
    fn from(config: &MediaConfig) -> Self {
        Self {
            engine_address: config.kurento_url.clone(),
            use_encoded_media: config.use_encoded_media,
            network_cache: config.network_cache,
            probe_interval: config.probe_interval(),
            reconnect: ReconnectPolicy {
                max_attempts: config.reconnect_max_attempts,
                min_delay: Duration::from_millis(config.reconnect_min_delay_ms),
                max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            },
        }
    }
}

#[derive(Default)]
struct IngestInner {
    engine: Option<Arc<dyn MediaEngine>>,
    pipeline: Option<Arc<dyn MediaPipeline>>,
    player: Option<Arc<dyn MediaElement>>,
    options: Option<PlayerOptions>,
    generation: u64,
    /// Health monitor and reconnect task
    monitor: Option<AbortHandle>,
}

/// A published ingest endpoint and its end-of-stream feed
struct Live {
    generation: u64,
    player: Arc<dyn MediaElement>,
    end_of_stream: Subscription,
}

pub struct IngestManager {
    connector: Arc<dyn EngineConnector>,
    settings: IngestSettings,
    registry: Arc<SessionRegistry>,
    inner: Mutex<IngestInner>,
    state: watch::Sender<IngestState>,
    reconnects: AtomicU64,
}

impl IngestManager {
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        settings: IngestSettings,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(IngestState::Disconnected);
        Arc::new(Self {
            connector,
            settings,
            registry,
            inner: Mutex::new(IngestInner::default()),
            state,
            reconnects: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn state(&self) -> IngestState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<IngestState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == IngestState::Stopped
    }

    /// Completed reconnect cycles
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// The published ingest endpoint, absent while reconnecting
    #[must_use]
    pub fn active_player(&self) -> Option<Arc<dyn MediaElement>> {
        self.inner.lock().player.clone()
    }

    #[must_use]
    pub fn pipeline(&self) -> Option<Arc<dyn MediaPipeline>> {
        self.inner.lock().pipeline.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Connect to the media engine and start pulling `uri`
    ///
    /// Only the first call proceeds; any later call fails with
    /// [`Error::AlreadyRunning`]. Connection or creation failures are
    /// returned as-is and leave the ingest `Failed`.
    pub async fn start(self: &Arc<Self>, uri: &str) -> Result<()> {
        {
            let _inner = self.inner.lock();
            if self.state() != IngestState::Disconnected {
                return Err(Error::AlreadyRunning);
            }
            self.state.send_replace(IngestState::Connecting);
        }

        let result = self.establish(uri).await;
        if let Err(e) = &result {
            error!(uri, error = %e, "Failed to start ingest");
            self.transition(IngestState::Failed);
        }
        result
    }

    async fn establish(self: &Arc<Self>, uri: &str) -> Result<()> {
        info!(address = %self.settings.engine_address, "Connecting to media engine");
        let engine = self.connector.connect(&self.settings.engine_address).await?;

        if !self.transition(IngestState::EstablishingPipeline) {
            return Err(Error::IngestStopped);
        }
        let pipeline = engine.create_pipeline().await?;
        debug!(pipeline = pipeline.id(), "Pipeline created");

        let options = PlayerOptions {
            uri: uri.to_string(),
            use_encoded_media: self.settings.use_encoded_media,
            network_cache: self.settings.network_cache,
        };

        let stored = {
            let mut inner = self.inner.lock();
            if self.is_stopped() {
                false
            } else {
                inner.engine = Some(engine);
                inner.pipeline = Some(Arc::clone(&pipeline));
                inner.options = Some(options.clone());
                true
            }
        };
        if !stored {
            release_pipeline(pipeline.as_ref()).await;
            return Err(Error::IngestStopped);
        }

        let live = self.create_player(&pipeline, &options).await?;
        self.spawn_supervisor(live);
        Ok(())
    }

    /// Create, start and publish a new ingest endpoint
    ///
    /// After publishing, every viewing session is rebound to the new
    /// endpoint.
    async fn create_player(&self, pipeline: &Arc<dyn MediaPipeline>, options: &PlayerOptions) -> Result<Live> {
        let player = pipeline.create_player(options).await?;

        let end_of_stream = match start_player(player.as_ref()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                release_element(player.as_ref(), "failed ingest endpoint").await;
                return Err(e);
            }
        };

        let generation = {
            let mut inner = self.inner.lock();
            if self.is_stopped() {
                None
            } else {
                inner.generation += 1;
                inner.player = Some(Arc::clone(&player));
                self.state.send_replace(IngestState::Playing);
                Some(inner.generation)
            }
        };
        let Some(generation) = generation else {
            release_element(player.as_ref(), "ingest endpoint").await;
            return Err(Error::IngestStopped);
        };
        info!(uri = %options.uri, generation, player = player.id(), "Ingest playing");

        self.rebind_viewers(player.as_ref()).await;

        Ok(Live {
            generation,
            player,
            end_of_stream,
        })
    }

    /// Bind every viewing session to `player`, tearing down those that fail
    async fn rebind_viewers(&self, player: &dyn MediaElement) {
        let viewers = self.registry.viewing_endpoints();
        if viewers.is_empty() {
            return;
        }

        let total = viewers.len();
        let mut failed = 0;
        for (claim, endpoint) in viewers {
            if let Err(e) = player.connect(endpoint.as_ref()).await {
                let session_id = claim.session_id();
                warn!(%session_id, error = %e, "Failed to rebind viewer, tearing down session");
                self.registry.release_claim(&claim).await;
                failed += 1;
            }
        }
        info!(viewers = total, failed, "Viewers rebound to ingest");
    }

    /// Run the health monitor for the first generation and keep replacing
    /// the ingest endpoint whenever it ends or stalls
    fn spawn_supervisor(self: &Arc<Self>, live: Live) {
        let generation = live.generation;
        let task = tokio::spawn(Arc::clone(self).supervise(live));

        let mut inner = self.inner.lock();
        if inner.generation == generation && !self.is_stopped() {
            inner.monitor = Some(task.abort_handle());
        } else {
            task.abort();
        }
    }

    async fn supervise(self: Arc<Self>, mut live: Live) {
        loop {
            let reason = self.watch_health(&mut live).await;
            match self.reconnect(live.generation, reason).await {
                Some(next) => live = next,
                None => return,
            }
        }
    }

    /// Wait until the ingest endpoint reports end of stream or a zero position
    async fn watch_health(&self, live: &mut Live) -> &'static str {
        let period = self.settings.probe_interval;
        let mut probe = time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                event = live.end_of_stream.recv(), if events_open => match event {
                    Some(MediaEvent::EndOfStream) => return "end of stream",
                    Some(_) => {}
                    None => {
                        debug!(generation = live.generation, "End-of-stream subscription closed");
                        events_open = false;
                    }
                },
                _ = probe.tick() => match live.player.get_position().await {
                    Ok(0) => return "stalled",
                    Ok(position) => trace!(generation = live.generation, position, "Ingest position"),
                    Err(e) => debug!(generation = live.generation, error = %e, "Position probe failed"),
                },
            }
        }
    }

    /// Replace the ingest endpoint of `generation`
    ///
    /// The pipeline and viewer sessions stay in place; viewers are rebound
    /// once the replacement is published. Returns the new generation, or
    /// `None` when the ingest stopped or ran out of attempts.
    async fn reconnect(&self, generation: u64, reason: &str) -> Option<Live> {
        let (previous, pipeline, options) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || self.state() != IngestState::Playing {
                debug!(generation, reason, "Ignoring stale reconnect trigger");
                return None;
            }
            let (Some(pipeline), Some(options)) = (inner.pipeline.clone(), inner.options.clone()) else {
                return None;
            };
            self.state.send_replace(IngestState::Reconnecting);
            (inner.player.take(), pipeline, options)
        };
        warn!(generation, reason, uri = %options.uri, "Ingest interrupted, reconnecting");

        if let Some(previous) = previous {
            if let Err(e) = previous.stop().await {
                debug!(generation, error = %e, "Failed to stop ingest endpoint");
            }
            release_element(previous.as_ref(), "ingest endpoint").await;
        }

        let mut attempts = 0;
        for delay in self.settings.reconnect.delays() {
            if delay > Duration::ZERO {
                time::sleep(delay).await;
            }
            if self.is_stopped() {
                return None;
            }

            attempts += 1;
            match self.create_player(&pipeline, &options).await {
                Ok(live) => {
                    let total = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(attempts, reconnects = total, "Ingest reconnected");
                    return Some(live);
                }
                Err(Error::IngestStopped) => return None,
                Err(e) => warn!(attempt = attempts, error = %e, "Ingest reconnect attempt failed"),
            }
        }

        error!(attempts, uri = %options.uri, "Ingest reconnect attempts exhausted");
        self.transition(IngestState::Failed);
        None
    }

    /// Stop monitoring and release the pipeline with everything it owns
    ///
    /// Safe to call repeatedly and before `start`.
    pub async fn stop(&self) {
        let (monitor, pipeline, player) = {
            let mut inner = self.inner.lock();
            let previous = self.state.send_replace(IngestState::Stopped);
            if previous != IngestState::Stopped {
                info!(from = %previous, "Ingest stopped");
            }
            inner.engine = None;
            inner.options = None;
            (inner.monitor.take(), inner.pipeline.take(), inner.player.take())
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        drop(player);
        if let Some(pipeline) = pipeline {
            release_pipeline(pipeline.as_ref()).await;
        }
    }

    /// Move to `next` unless already stopped
    fn transition(&self, next: IngestState) -> bool {
        let _inner = self.inner.lock();
        self.state.send_if_modified(|state| {
            if *state == IngestState::Stopped || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

/// Subscribe to end of stream before playback so the event cannot be missed
async fn start_player(player: &dyn MediaElement) -> Result<Subscription> {
    let subscription = player.subscribe(EventKind::EndOfStream).await?;
    player.play().await?;
    Ok(subscription)
}

async fn release_element(element: &dyn MediaElement, what: &str) {
    if let Err(e) = element.release().await {
        warn!(element = element.id(), error = %e, "Failed to release {what}");
    }
}

async fn release_pipeline(pipeline: &dyn MediaPipeline) {
    match pipeline.release().await {
        Ok(()) => debug!(pipeline = pipeline.id(), "Pipeline released"),
        Err(e) => warn!(pipeline = pipeline.id(), error = %e, "Failed to release pipeline"),
    }
}
