//! Matchmaking queue.
//!
//! Connections waiting for a stranger partner. An arrival is paired with the
//! most recently enqueued waiter (tail pop); a waiter that turns out to be
//! dead is discarded and the arrival takes its place instead. Stale entries
//! are only cleaned when popped or when their connection disconnects.

use tracing::debug;

use duo_shared::ConnectionId;

/// What happened to a connection that asked to be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Already waiting; nothing changed.
    AlreadyQueued,
    /// Queue was empty; the connection now waits.
    Waiting,
    /// The popped waiter was dead and was discarded; the connection now waits.
    ReplacedStale { stale: ConnectionId },
    /// Popped a live waiter to pair with.
    Matched { partner: ConnectionId },
}

#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    waiting: Vec<ConnectionId>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `conn` for pairing. `is_live` decides whether a popped waiter can
    /// still be addressed.
    pub fn enqueue(
        &mut self,
        conn: ConnectionId,
        is_live: impl Fn(ConnectionId) -> bool,
    ) -> EnqueueOutcome {
        if self.contains(conn) {
            return EnqueueOutcome::AlreadyQueued;
        }

        let Some(candidate) = self.waiting.pop() else {
            self.waiting.push(conn);
            return EnqueueOutcome::Waiting;
        };

        if is_live(candidate) {
            EnqueueOutcome::Matched { partner: candidate }
        } else {
            debug!(stale = %candidate, conn = %conn, "Discarded stale queue entry");
            self.waiting.push(conn);
            EnqueueOutcome::ReplacedStale { stale: candidate }
        }
    }

    /// Put a connection at the tail without attempting a match.
    pub fn push(&mut self, conn: ConnectionId) {
        if !self.contains(conn) {
            self.waiting.push(conn);
        }
    }

    pub fn remove(&mut self, conn: ConnectionId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|c| *c != conn);
        self.waiting.len() != before
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.waiting.contains(&conn)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Waiting connections, oldest first.
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.waiting.clone()
    }
}
