//! Client session tracking for notification fan-out
//!
//! This module tracks every connected client session:
//! - Session lifecycle (connecting, active, lagging, disconnected)
//! - Delivery outcomes and consecutive send failures
//! - Acknowledged turns and the backlog of unacknowledged records
//! - Capacity limits and idle timeouts
//!
//! The registry is shared as `Arc<RwLock<SessionRegistry>>`. The dispatcher
//! takes a snapshot of live transports under the read lock, sends without
//! holding any lock, then records outcomes under the write lock. Sessions may
//! therefore be added or removed while a broadcast is in progress.

use crate::config::PipelineConfig;
use crate::transport::{Transport, TransportError};
use log::{info, warn};
use shared::{SessionId, TurnNumber};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted but nothing delivered yet.
    Connecting,
    Active,
    /// Failing sends or too far behind on acknowledgments.
    Lagging,
    /// Awaiting removal; receives nothing further.
    Disconnected,
}

/// A connected client and its delivery bookkeeping
pub struct Session {
    /// Unique session identifier assigned by the registry
    pub id: SessionId,
    /// Display name the client connected with
    pub nick: String,
    pub state: SessionState,
    /// Highest turn the client has confirmed
    pub last_acked_turn: Option<TurnNumber>,
    /// Turn of the most recent record delivered to the transport
    pub last_sent_turn: Option<TurnNumber>,
    /// Failed sends since the last successful one
    pub consecutive_failures: u32,
    /// Last time the client sent us anything
    pub last_seen: Instant,
    /// Turns of delivered but unacknowledged records, oldest first
    unacked: VecDeque<TurnNumber>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("nick", &self.nick)
            .field("peer", &self.transport.peer())
            .field("state", &self.state)
            .field("last_acked_turn", &self.last_acked_turn)
            .field("unacked", &self.unacked.len())
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl Session {
    fn new(id: SessionId, nick: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            nick: nick.to_string(),
            state: SessionState::Connecting,
            last_acked_turn: None,
            last_sent_turn: None,
            consecutive_failures: 0,
            last_seen: Instant::now(),
            unacked: VecDeque::new(),
            transport,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != SessionState::Disconnected
    }

    /// Number of delivered records the client has not acknowledged yet.
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Checks if the client has been silent for longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Thresholds applied when recording delivery outcomes.
#[derive(Debug, Clone, Copy)]
struct SessionPolicy {
    max_send_failures: u32,
    lag_threshold: usize,
    disconnect_threshold: usize,
    require_acks: bool,
}

impl From<&PipelineConfig> for SessionPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_send_failures: config.max_send_failures,
            lag_threshold: config.lag_threshold,
            disconnect_threshold: config.disconnect_threshold,
            require_acks: config.require_acks,
        }
    }
}

/// Registry of every connected session
///
/// Enforces the session capacity, hands out session IDs starting from 1,
/// and applies the lag and failure policy to each delivery outcome.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    next_session_id: SessionId,
    max_sessions: usize,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, config: &PipelineConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
            policy: SessionPolicy::from(config),
        }
    }

    /// Registers a freshly accepted transport
    ///
    /// Returns None if the server is at capacity. The session starts out
    /// `Connecting` and becomes `Active` on its first successful delivery.
    pub fn add_session(&mut self, nick: &str, transport: Arc<dyn Transport>) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        info!(
            "Session {} ({}) connected from {}",
            id,
            nick,
            transport.peer()
        );
        self.sessions.insert(id, Session::new(id, nick, transport));
        Some(id)
    }

    /// Removes a session. Returns false if it was already gone.
    pub fn remove_session(&mut self, id: &SessionId) -> bool {
        if let Some(session) = self.sessions.remove(id) {
            info!("Session {} ({}) removed", session.id, session.nick);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|session| session.state)
    }

    /// Finds the session whose transport talks to `peer`.
    pub fn find_by_peer(&self, peer: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.transport.peer() == peer)
            .map(|session| session.id)
    }

    /// Calls `f` for every session that still receives broadcasts.
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        for session in self.sessions.values().filter(|session| session.is_live()) {
            f(session);
        }
    }

    /// Snapshot of the transports a broadcast should reach, in session order.
    pub fn live_targets(&self) -> Vec<(SessionId, Arc<dyn Transport>)> {
        let mut targets: Vec<(SessionId, Arc<dyn Transport>)> =
            Vec::with_capacity(self.sessions.len());
        self.for_each_active(|session| {
            targets.push((session.id, Arc::clone(&session.transport)));
        });
        targets.sort_by_key(|(id, _)| *id);
        targets
    }

    /// Records a successful send of a record from `turn`.
    pub fn record_delivery(&mut self, id: SessionId, turn: TurnNumber) -> Option<SessionState> {
        let policy = self.policy;
        let session = self.sessions.get_mut(&id)?;
        if !session.is_live() {
            return Some(session.state);
        }

        session.consecutive_failures = 0;
        session.last_sent_turn = Some(turn);
        if policy.require_acks {
            session.unacked.push_back(turn);
        } else {
            session.last_acked_turn = session.last_acked_turn.max(Some(turn));
        }
        Some(Self::reevaluate(session, &policy))
    }

    /// Records a failed or timed-out send.
    pub fn record_failure(&mut self, id: SessionId, error: &TransportError) -> Option<SessionState> {
        let policy = self.policy;
        let session = self.sessions.get_mut(&id)?;
        if !session.is_live() {
            return Some(session.state);
        }

        session.consecutive_failures += 1;
        warn!(
            "Send to session {} ({}) failed ({}/{}): {}",
            session.id,
            session.nick,
            session.consecutive_failures,
            policy.max_send_failures,
            error
        );
        if session.consecutive_failures >= policy.max_send_failures {
            Self::transition(session, SessionState::Disconnected);
            return Some(session.state);
        }
        Some(Self::reevaluate(session, &policy))
    }

    /// Applies a client acknowledgment. Stale or repeated acks change nothing.
    pub fn acknowledge(&mut self, id: SessionId, turn: TurnNumber) -> bool {
        let policy = self.policy;
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };

        session.last_seen = Instant::now();
        session.last_acked_turn = session.last_acked_turn.max(Some(turn));
        while session.unacked.front().is_some_and(|sent| *sent <= turn) {
            session.unacked.pop_front();
        }
        if session.is_live() && session.state != SessionState::Connecting {
            Self::reevaluate(session, &policy);
        }
        true
    }

    /// Marks a session as heard from without acknowledging anything.
    pub fn touch(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_seen = Instant::now();
        }
    }

    fn reevaluate(session: &mut Session, policy: &SessionPolicy) -> SessionState {
        let backlog = session.unacked.len();
        let next = if backlog > policy.disconnect_threshold {
            SessionState::Disconnected
        } else if backlog > policy.lag_threshold || session.consecutive_failures > 0 {
            SessionState::Lagging
        } else {
            SessionState::Active
        };
        Self::transition(session, next);
        session.state
    }

    fn transition(session: &mut Session, next: SessionState) {
        if session.state == next {
            return;
        }
        match next {
            SessionState::Disconnected => warn!(
                "Session {} ({}) disconnected: {} failed sends, {} unacknowledged records",
                session.id,
                session.nick,
                session.consecutive_failures,
                session.unacked.len()
            ),
            SessionState::Lagging => warn!(
                "Session {} ({}) is lagging ({} unacknowledged records)",
                session.id,
                session.nick,
                session.unacked.len()
            ),
            _ => info!(
                "Session {} ({}) {:?} -> {:?}",
                session.id, session.nick, session.state, next
            ),
        }
        session.state = next;
    }

    /// Removes and returns every session marked disconnected.
    pub fn reap_disconnected(&mut self) -> Vec<SessionId> {
        let dead: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| !session.is_live())
            .map(|session| session.id)
            .collect();

        for id in &dead {
            self.remove_session(id);
        }
        dead
    }

    /// Disconnects sessions silent for longer than `timeout`
    ///
    /// Returns the removed session IDs so the caller can clean up.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<SessionId> {
        let timed_out: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout))
            .map(|session| session.id)
            .collect();

        for id in &timed_out {
            if let Some(session) = self.sessions.get_mut(id) {
                Self::transition(session, SessionState::Disconnected);
            }
            self.remove_session(id);
        }
        timed_out
    }

    /// Lowest acknowledged turn among active sessions, used for driver backpressure.
    pub fn slowest_active_ack(&self) -> Option<TurnNumber> {
        self.sessions
            .values()
            .filter(|session| session.state == SessionState::Active)
            .filter_map(|session| session.last_acked_turn)
            .min()
    }

    /// Returns the number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
