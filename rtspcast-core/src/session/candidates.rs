//! Per-session buffer of connectivity candidates
//!
//! Candidates that arrive before a session's relay endpoint exists are
//! parked here and replayed in arrival order once it does.

use std::collections::{HashMap, VecDeque};

use crate::types::{IceCandidate, SessionId};

#[derive(Debug, Default)]
pub struct CandidateQueue {
    queues: HashMap<SessionId, VecDeque<IceCandidate>>,
}

impl CandidateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate, creating the session's queue if needed
    pub fn enqueue(&mut self, id: &SessionId, candidate: IceCandidate) {
        self.queues.entry(id.clone()).or_default().push_back(candidate);
    }

    /// Take the oldest queued candidate; the queue is discarded once empty
    pub fn pop_front(&mut self, id: &SessionId) -> Option<IceCandidate> {
        let queue = self.queues.get_mut(id)?;
        let candidate = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(id);
        }
        candidate
    }

    /// Discard a session's queue without applying it, returning how many were dropped
    pub fn clear(&mut self, id: &SessionId) -> usize {
        self.queues.remove(id).map_or(0, |q| q.len())
    }

    #[must_use]
    pub fn len(&self, id: &SessionId) -> usize {
        self.queues.get(id).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.queues.contains_key(id)
    }

    /// Number of sessions holding queued candidates
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n}"), "0", 0)
    }

    #[test]
    fn test_fifo_per_session() {
        let mut queue = CandidateQueue::new();
        let a = SessionId::from("0");
        let b = SessionId::from("1");

        queue.enqueue(&a, candidate(1));
        queue.enqueue(&b, candidate(10));
        queue.enqueue(&a, candidate(2));
        queue.enqueue(&a, candidate(3));

        assert_eq!(queue.len(&a), 3);
        assert_eq!(queue.pop_front(&a), Some(candidate(1)));
        assert_eq!(queue.pop_front(&a), Some(candidate(2)));
        assert_eq!(queue.pop_front(&a), Some(candidate(3)));
        assert_eq!(queue.pop_front(&a), None);
        assert!(!queue.contains(&a));
        assert_eq!(queue.pop_front(&b), Some(candidate(10)));
    }

    #[test]
    fn test_clear() {
        let mut queue = CandidateQueue::new();
        let id = SessionId::from("4");
        queue.enqueue(&id, candidate(1));
        queue.enqueue(&id, candidate(2));

        assert_eq!(queue.clear(&id), 2);
        assert_eq!(queue.clear(&id), 0);
        assert_eq!(queue.session_count(), 0);
    }
}
