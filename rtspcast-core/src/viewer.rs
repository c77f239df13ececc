//! Viewer session manager
//!
//! Joins a viewer to the ingest: creates its relay endpoint, completes the
//! offer/answer exchange and binds the endpoint to the current ingest
//! endpoint. Every await in the join can interleave with ingest reconnects,
//! shutdown or the viewer disconnecting, so the shared state is re-checked
//! with [`ViewerManager::ensure_viewing`] after each engine call. The join
//! acts through its [`Claim`] only, never through the bare session id.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{EventKind, MediaElement, MediaEvent, MediaPipeline};
use crate::error::{Error, Result};
use crate::ingest::IngestManager;
use crate::protocol::ServerMessage;
use crate::session::{CandidateRoute, Claim, ConnectionHandle, SessionRegistry};
use crate::types::{IceCandidate, SessionId};

pub struct ViewerManager {
    registry: Arc<SessionRegistry>,
    ingest: Arc<IngestManager>,
}

impl ViewerManager {
    pub fn new(registry: Arc<SessionRegistry>, ingest: Arc<IngestManager>) -> Arc<Self> {
        Arc::new(Self { registry, ingest })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn ingest(&self) -> &Arc<IngestManager> {
        &self.ingest
    }

    /// Join `id` as a viewer, returning the SDP answer for `offer`
    ///
    /// On any failure after the session was claimed, the session is
    /// returned to idle and its partially created endpoint released.
    pub async fn request_view(&self, id: &SessionId, offer: &str) -> Result<String> {
        let pipeline = match self.ingest.pipeline() {
            Some(pipeline) if self.ingest.is_active() => pipeline,
            _ => return Err(Error::NoActiveStream),
        };
        let claim = self.registry.claim(id)?;
        info!(session_id = %id, "Viewer joining");

        match self.negotiate(&claim, pipeline.as_ref(), offer).await {
            Ok(answer) => {
                info!(session_id = %id, "Viewer accepted");
                Ok(answer)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Viewer rejected");
                self.registry.release_claim(&claim).await;
                if self.ingest.is_active() {
                    Err(e)
                } else {
                    Err(Error::NoActiveStream)
                }
            }
        }
    }

    async fn negotiate(&self, claim: &Claim, pipeline: &dyn MediaPipeline, offer: &str) -> Result<String> {
        let id = claim.session_id();
        let endpoint = pipeline.create_webrtc_endpoint().await?;
        debug!(session_id = %id, endpoint = endpoint.id(), "Relay endpoint created");

        let registered = if self.ingest.is_active() {
            self.registry.register(claim, Arc::clone(&endpoint))
        } else {
            Err(Error::NoActiveStream)
        };
        if let Err(e) = registered {
            if let Err(release_err) = endpoint.release().await {
                warn!(session_id = %id, error = %release_err, "Failed to release unregistered endpoint");
            }
            return Err(e);
        }

        self.registry.drain_candidates(claim, endpoint.as_ref()).await;
        self.forward_candidates(claim, endpoint.as_ref()).await?;

        let answer = endpoint.process_offer(offer).await?;
        self.ensure_viewing(claim)?;

        // Without a published ingest endpoint the reconnect rebind binds us
        match self.ingest.active_player() {
            Some(player) => player.connect(endpoint.as_ref()).await?,
            None => debug!(session_id = %id, "Ingest reconnecting, deferring bind"),
        }
        self.ensure_viewing(claim)?;

        let gatherer = Arc::clone(&endpoint);
        let session_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = gatherer.gather_candidates().await {
                warn!(%session_id, error = %e, "Candidate gathering failed");
            }
        });

        Ok(answer)
    }

    /// Relay candidates discovered by `endpoint` to the viewer connection
    async fn forward_candidates(&self, claim: &Claim, endpoint: &dyn MediaElement) -> Result<()> {
        let mut events = endpoint.subscribe(EventKind::IceCandidate).await?;
        let connection = self.connection_for(claim)?;

        let session_id = claim.session_id().clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let MediaEvent::IceCandidate(candidate) = event {
                    if !connection.send(ServerMessage::IceCandidate { candidate }) && connection.is_closed() {
                        break;
                    }
                }
            }
            debug!(%session_id, "Candidate forwarding ended");
        });

        if !self.registry.set_forwarder(claim, task.abort_handle()) {
            return Err(Error::SessionClosed(claim.session_id().clone()));
        }
        Ok(())
    }

    fn connection_for(&self, claim: &Claim) -> Result<ConnectionHandle> {
        self.ensure_viewing(claim)?;
        self.registry
            .connection(claim)
            .ok_or_else(|| Error::SessionClosed(claim.session_id().clone()))
    }

    /// The join may continue only while the ingest is active and `claim`
    /// still holds its bound endpoint
    pub fn ensure_viewing(&self, claim: &Claim) -> Result<()> {
        if !self.ingest.is_active() {
            return Err(Error::NoActiveStream);
        }
        if !self.registry.is_viewing(claim) {
            return Err(Error::SessionClosed(claim.session_id().clone()));
        }
        Ok(())
    }

    /// Apply a viewer candidate, or queue it until the endpoint is ready
    pub async fn add_ice_candidate(&self, id: &SessionId, candidate: IceCandidate) {
        match self.registry.route_candidate(id, candidate) {
            CandidateRoute::Apply { endpoint, candidate } => {
                if let Err(e) = endpoint.add_ice_candidate(&candidate).await {
                    warn!(session_id = %id, error = %e, "Failed to apply candidate");
                }
            }
            CandidateRoute::Queued => debug!(session_id = %id, "Candidate queued"),
            CandidateRoute::Dropped => debug!(session_id = %id, "Candidate for closed session dropped"),
        }
    }

    /// Leave the viewing state, keeping the connection open
    pub async fn stop_viewing(&self, id: &SessionId) -> bool {
        self.registry.detach(id).await
    }
}
