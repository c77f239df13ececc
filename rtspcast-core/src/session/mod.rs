//! Session registry
//!
//! Tracks one session per viewer connection from connect to disconnect:
//!
//! - **Idle**: connected, no negotiation in progress
//! - **Negotiating**: a join request has claimed the session, no endpoint yet
//! - **Viewing**: a relay endpoint is bound to the session
//!
//! Candidates for a session are queued until its endpoint is bound and the
//! queue has been replayed; from then on they go straight to the endpoint.
//! The registry lock is never held across an engine call.
//!
//! Ids are reused as soon as a connection closes, so a join outliving its
//! connection must not act on the id alone. Each join holds a [`Claim`] and
//! every later step of it is refused once the claim is no longer current.

mod candidates;
mod connection;

pub use candidates::CandidateQueue;
pub use connection::{ConnectionHandle, Outbound};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::engine::MediaElement;
use crate::error::{Error, Result};
use crate::types::{IceCandidate, SessionId};

enum SessionState {
    Idle,
    Negotiating {
        ticket: u64,
    },
    Viewing {
        ticket: u64,
        endpoint: Arc<dyn MediaElement>,
        /// Queue replayed; new candidates bypass it
        candidates_flowing: bool,
        /// Task forwarding locally discovered candidates to the viewer
        forwarder: Option<AbortHandle>,
    },
}

impl SessionState {
    const fn ticket(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Negotiating { ticket } | Self::Viewing { ticket, .. } => Some(*ticket),
        }
    }
}

struct Session {
    connection: ConnectionHandle,
    state: SessionState,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    candidates: CandidateQueue,
    next_ticket: u64,
}

impl RegistryInner {
    /// The session `claim` was issued for, if the claim is still current
    fn claimed(&mut self, claim: &Claim) -> Option<&mut Session> {
        self.sessions
            .get_mut(&claim.id)
            .filter(|session| session.state.ticket() == Some(claim.ticket))
    }
}

/// A join's reservation of a session
///
/// Issued by [`SessionRegistry::claim`] and presented by every later step
/// of the same join. It stops matching once the join is torn down or the
/// connection closes, even if the id has been handed to a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    id: SessionId,
    ticket: u64,
}

impl Claim {
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connection: ConnectionHandle,
    pub endpoint: Option<Arc<dyn MediaElement>>,
    pub negotiating: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Connected sessions
    pub sessions: usize,
    /// Sessions with a bound relay endpoint
    pub viewers: usize,
    /// Sessions holding queued candidates
    pub queued: usize,
}

/// Where an inbound candidate has to go
pub enum CandidateRoute {
    /// Endpoint is live: apply now
    Apply {
        endpoint: Arc<dyn MediaElement>,
        candidate: IceCandidate,
    },
    /// Parked until the endpoint is bound and drained
    Queued,
    /// Session is gone
    Dropped,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve the lowest unused id for a new connection
    pub fn allocate_id(&self, connection: ConnectionHandle) -> SessionId {
        let mut inner = self.inner.lock();
        // At most `len` ids are taken, so one of 0..=len is free
        let id = (0..=inner.sessions.len())
            .map(SessionId::from)
            .find(|id| !inner.sessions.contains_key(id))
            .unwrap_or_else(|| SessionId::from(inner.sessions.len()));
        inner.sessions.insert(
            id.clone(),
            Session {
                connection,
                state: SessionState::Idle,
            },
        );
        debug!(session_id = %id, "Session allocated");
        id
    }

    /// Mark a session as negotiating
    ///
    /// Runs before any engine call so concurrent join requests for the
    /// same session cannot both pass the duplicate check.
    pub fn claim(&self, id: &SessionId) -> Result<Claim> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionClosed(id.clone()))?;
        match session.state {
            SessionState::Idle => {
                inner.next_ticket += 1;
                let ticket = inner.next_ticket;
                session.state = SessionState::Negotiating { ticket };
                Ok(Claim {
                    id: id.clone(),
                    ticket,
                })
            }
            SessionState::Negotiating { .. } | SessionState::Viewing { .. } => Err(Error::AlreadyViewing),
        }
    }

    /// Bind a freshly created relay endpoint to a claimed session
    pub fn register(&self, claim: &Claim, endpoint: Arc<dyn MediaElement>) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.claimed(claim) {
            Some(session) if matches!(session.state, SessionState::Negotiating { .. }) => {
                info!(session_id = %claim.id, endpoint = endpoint.id(), "Viewer endpoint registered");
                session.state = SessionState::Viewing {
                    ticket: claim.ticket,
                    endpoint,
                    candidates_flowing: false,
                    forwarder: None,
                };
                Ok(())
            }
            // Torn down while the endpoint was being created
            _ => Err(Error::SessionClosed(claim.id.clone())),
        }
    }

    /// Whether `claim` still holds a bound endpoint
    #[must_use]
    pub fn is_viewing(&self, claim: &Claim) -> bool {
        matches!(
            self.inner.lock().claimed(claim).map(|s| &s.state),
            Some(SessionState::Viewing { .. })
        )
    }

    /// Connection of the session `claim` was issued for
    #[must_use]
    pub fn connection(&self, claim: &Claim) -> Option<ConnectionHandle> {
        self.inner.lock().claimed(claim).map(|s| s.connection.clone())
    }

    #[must_use]
    pub fn lookup(&self, id: &SessionId) -> Option<SessionInfo> {
        let inner = self.inner.lock();
        inner.sessions.get(id).map(|session| SessionInfo {
            id: id.clone(),
            connection: session.connection.clone(),
            endpoint: match &session.state {
                SessionState::Viewing { endpoint, .. } => Some(Arc::clone(endpoint)),
                _ => None,
            },
            negotiating: matches!(session.state, SessionState::Negotiating { .. }),
        })
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    /// Whether `id` is still bound to the endpoint with `endpoint_id`
    #[must_use]
    pub fn is_bound(&self, id: &SessionId, endpoint_id: &str) -> bool {
        matches!(
            self.inner.lock().sessions.get(id).map(|s| &s.state),
            Some(SessionState::Viewing { endpoint, .. }) if endpoint.id() == endpoint_id
        )
    }

    /// Attach the candidate forwarding task of a viewing session
    ///
    /// If the session is no longer viewing the task is aborted at once.
    pub fn set_forwarder(&self, claim: &Claim, handle: AbortHandle) -> bool {
        let mut inner = self.inner.lock();
        if let Some(Session {
            state: SessionState::Viewing { forwarder, .. },
            ..
        }) = inner.claimed(claim)
        {
            if let Some(previous) = forwarder.replace(handle) {
                previous.abort();
            }
            return true;
        }
        handle.abort();
        false
    }

    /// Decide whether a candidate can be applied now or must wait
    pub fn route_candidate(&self, id: &SessionId, candidate: IceCandidate) -> CandidateRoute {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.sessions.get(id).map(|s| &s.state) {
            None => CandidateRoute::Dropped,
            Some(SessionState::Viewing {
                endpoint,
                candidates_flowing: true,
                ..
            }) => CandidateRoute::Apply {
                endpoint: Arc::clone(endpoint),
                candidate,
            },
            Some(_) => {
                inner.candidates.enqueue(id, candidate);
                CandidateRoute::Queued
            }
        }
    }

    /// Replay a session's queued candidates into its endpoint in arrival order
    ///
    /// Candidates arriving while the replay runs are queued behind it; the
    /// session switches to direct delivery only once the queue is empty.
    /// Failures are logged per candidate and do not stop the replay. The
    /// replay stops as soon as `claim` is no longer current, leaving the
    /// queue to whichever connection holds the id now.
    pub async fn drain_candidates(&self, claim: &Claim, endpoint: &dyn MediaElement) -> usize {
        let id = &claim.id;
        let mut applied = 0;
        loop {
            let next = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let Some(Session {
                    state: SessionState::Viewing {
                        endpoint: bound,
                        candidates_flowing,
                        ..
                    },
                    ..
                }) = inner
                    .sessions
                    .get_mut(id)
                    .filter(|s| s.state.ticket() == Some(claim.ticket))
                else {
                    break;
                };
                match inner.candidates.pop_front(id) {
                    Some(candidate) => candidate,
                    None => {
                        if bound.id() == endpoint.id() {
                            *candidates_flowing = true;
                        }
                        break;
                    }
                }
            };

            if let Err(e) = endpoint.add_ice_candidate(&next).await {
                warn!(session_id = %id, error = %e, "Failed to apply queued candidate");
            }
            applied += 1;
        }

        if applied > 0 {
            debug!(session_id = %id, applied, "Queued candidates drained");
        }
        applied
    }

    /// Discard queued candidates without applying them
    pub fn clear_candidates(&self, id: &SessionId) -> usize {
        self.inner.lock().candidates.clear(id)
    }

    #[must_use]
    pub fn queued_candidates(&self, id: &SessionId) -> usize {
        self.inner.lock().candidates.len(id)
    }

    /// Tear down the join holding `claim`, keeping the connection's id
    ///
    /// A no-op returning `false` when the claim is no longer current, so a
    /// join outliving its connection never touches the id's new owner.
    pub async fn release_claim(&self, claim: &Claim) -> bool {
        let state = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(session) = inner.claimed(claim) else {
                return false;
            };
            let state = std::mem::replace(&mut session.state, SessionState::Idle);
            let dropped = inner.candidates.clear(&claim.id);
            debug!(session_id = %claim.id, dropped_candidates = dropped, "Viewer join torn down");
            state
        };
        release_state(&claim.id, state).await;
        true
    }

    /// Tear down a session's viewing state but keep the connection's id
    ///
    /// Releases the bound endpoint and clears queued candidates. Returns
    /// `false` when there was nothing to tear down.
    pub async fn detach(&self, id: &SessionId) -> bool {
        let (state, dropped) = {
            let mut inner = self.inner.lock();
            let dropped = inner.candidates.clear(id);
            let state = inner
                .sessions
                .get_mut(id)
                .map(|s| std::mem::replace(&mut s.state, SessionState::Idle));
            (state, dropped)
        };

        let had_state = !matches!(state, None | Some(SessionState::Idle));
        if had_state || dropped > 0 {
            debug!(session_id = %id, dropped_candidates = dropped, "Viewer session detached");
        }
        if let Some(state) = state {
            release_state(id, state).await;
        }
        had_state || dropped > 0
    }

    /// Remove a session entirely, releasing its endpoint and queue
    ///
    /// Removing an unknown id is a no-op returning `false`.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            inner.candidates.clear(id);
            inner.sessions.remove(id)
        };

        match session {
            Some(session) => {
                info!(session_id = %id, "Session removed");
                release_state(id, session.state).await;
                true
            }
            None => false,
        }
    }

    /// Remove every session, asking each connection to close
    pub async fn remove_all(&self) -> usize {
        let sessions: Vec<(SessionId, Session)> = {
            let mut inner = self.inner.lock();
            inner.candidates = CandidateQueue::new();
            inner.sessions.drain().collect()
        };

        let count = sessions.len();
        for (id, session) in sessions {
            release_state(&id, session.state).await;
            session.connection.close();
        }
        count
    }

    /// Claims and endpoints of every viewing session
    #[must_use]
    pub fn viewing_endpoints(&self) -> Vec<(Claim, Arc<dyn MediaElement>)> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter_map(|(id, s)| match &s.state {
                SessionState::Viewing { ticket, endpoint, .. } => Some((
                    Claim {
                        id: id.clone(),
                        ticket: *ticket,
                    },
                    Arc::clone(endpoint),
                )),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            sessions: inner.sessions.len(),
            viewers: inner
                .sessions
                .values()
                .filter(|s| matches!(s.state, SessionState::Viewing { .. }))
                .count(),
            queued: inner.candidates.session_count(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

/// Best-effort release of whatever a session held
async fn release_state(id: &SessionId, state: SessionState) {
    if let SessionState::Viewing {
        endpoint, forwarder, ..
    } = state
    {
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Err(e) = endpoint.release().await {
            warn!(session_id = %id, endpoint = endpoint.id(), error = %e, "Failed to release viewer endpoint");
        }
    }
}
