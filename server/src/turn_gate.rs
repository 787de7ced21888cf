//! Per-turn gate coordinating producers with the turn driver
//!
//! Every producer (creature AI, player command handling, the driver itself)
//! registers for the open turn before it mutates the dungeon and enqueues
//! notifications, and completes its [`WorkTicket`] when it is done. The driver
//! calls [`TurnGate::await_turn_complete`] and only then [`TurnGate::advance`].
//!
//! Each turn moves through three phases:
//!
//! - `Open`: producers may register and enqueue
//! - `Draining`: the driver is waiting; no new registrations are accepted
//! - `Closed`: nothing is outstanding and the driver may advance
//!
//! Because a record can only be enqueued while its ticket is held for the open
//! turn, and the turn cannot close while a ticket is held, every record for
//! turn T is in the queue before any record for turn T+1.
//!
//! A producer that never completes would hold the driver forever. The wait is
//! therefore bounded by the configured stall timeout; on expiry the gate logs
//! the stalled producers, revokes their tickets and closes the turn anyway.
//! Anything a revoked ticket tries to enqueue afterwards is dropped.

use crate::config::PipelineConfig;
use crate::turn_clock::TurnClock;
use log::{debug, info, warn};
use shared::TurnNumber;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("work registered for turn {requested} but turn {current} is open")]
    WrongTurn {
        requested: TurnNumber,
        current: TurnNumber,
    },
    #[error("turn {turn} is no longer accepting work")]
    TurnClosing { turn: TurnNumber },
    #[error("ticket held by '{producer}' for turn {ticket_turn} is no longer live (gate is at turn {current})")]
    StaleTicket {
        producer: String,
        ticket_turn: TurnNumber,
        current: TurnNumber,
    },
    #[error("turn gate has shut down")]
    ShutDown,
    #[error("turn gate invariant violated: {0}")]
    InvariantViolation(String),
}

/// Proof that a producer holds the current turn open.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a ticket holds its turn open until passed to TurnGate::complete_work"]
pub struct WorkTicket {
    turn: TurnNumber,
    producer: String,
}

impl WorkTicket {
    pub fn turn(&self) -> TurnNumber {
        self.turn
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Every producer completed and, if required, every record was dispatched.
    Completed,
    /// The stall timeout fired and the turn was closed without the listed producers.
    ForcedAdvance {
        stalled: Vec<String>,
        undelivered: usize,
    },
    /// The gate was shut down while the driver waited.
    Shutdown,
}

/// Point-in-time copy of the gate state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSnapshot {
    pub turn: TurnNumber,
    pub phase: TurnPhase,
    pub outstanding: BTreeMap<String, usize>,
    pub in_flight: usize,
    pub shut_down: bool,
}

#[derive(Debug)]
struct GateState {
    turn: TurnNumber,
    phase: TurnPhase,
    /// Producer name -> number of tickets it holds for `turn`.
    producers: BTreeMap<String, usize>,
    /// Records of `turn` enqueued but not yet broadcast.
    in_flight: usize,
    shut_down: bool,
}

impl GateState {
    fn holds(&self, ticket: &WorkTicket) -> bool {
        ticket.turn == self.turn && self.producers.contains_key(&ticket.producer)
    }

    fn stale(&self, ticket: &WorkTicket) -> GateError {
        GateError::StaleTicket {
            producer: ticket.producer.clone(),
            ticket_turn: ticket.turn,
            current: self.turn,
        }
    }
}

pub struct TurnGate {
    clock: Arc<TurnClock>,
    state: Mutex<GateState>,
    /// Bumped on every state change the driver may be waiting for.
    changes: watch::Sender<u64>,
    stall_timeout: Duration,
    wait_for_dispatch: bool,
}

impl TurnGate {
    /// Creates a gate with the clock's current turn open.
    pub fn new(clock: Arc<TurnClock>, config: &PipelineConfig) -> Self {
        let (changes, _) = watch::channel(0);
        let turn = clock.current_turn();
        Self {
            clock,
            state: Mutex::new(GateState {
                turn,
                phase: TurnPhase::Open,
                producers: BTreeMap::new(),
                in_flight: 0,
                shut_down: false,
            }),
            changes,
            stall_timeout: config.stall_timeout,
            wait_for_dispatch: config.wait_for_dispatch,
        }
    }

    pub fn clock(&self) -> &Arc<TurnClock> {
        &self.clock
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Declares pending work for `turn` on behalf of `producer`.
    ///
    /// Registering for any turn but the open one is a scheduling bug upstream;
    /// it is logged and rejected.
    pub fn register_work(&self, turn: TurnNumber, producer: &str) -> Result<WorkTicket, GateError> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(GateError::ShutDown);
        }
        if turn != state.turn {
            warn!(
                "Producer '{}' registered for turn {} but turn {} is open; work rejected",
                producer, turn, state.turn
            );
            return Err(GateError::WrongTurn {
                requested: turn,
                current: state.turn,
            });
        }
        Self::register_locked(&mut state, producer)
    }

    /// Registers for whichever turn is open right now.
    pub fn register_current(&self, producer: &str) -> Result<WorkTicket, GateError> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(GateError::ShutDown);
        }
        Self::register_locked(&mut state, producer)
    }

    /// Registers for the next turn that accepts work, suspending while the
    /// current one drains.
    pub async fn register_when_open(&self, producer: &str) -> Result<WorkTicket, GateError> {
        let mut changes = self.changes.subscribe();
        loop {
            changes.borrow_and_update();
            match self.register_current(producer) {
                Err(GateError::TurnClosing { .. }) => {}
                other => return other,
            }
            if changes.changed().await.is_err() {
                return Err(GateError::ShutDown);
            }
        }
    }

    fn register_locked(state: &mut GateState, producer: &str) -> Result<WorkTicket, GateError> {
        if state.phase != TurnPhase::Open {
            debug!(
                "Producer '{}' too late for turn {} ({:?})",
                producer, state.turn, state.phase
            );
            return Err(GateError::TurnClosing { turn: state.turn });
        }
        *state.producers.entry(producer.to_string()).or_insert(0) += 1;
        Ok(WorkTicket {
            turn: state.turn,
            producer: producer.to_string(),
        })
    }

    /// Releases the producer's hold on the ticket's turn.
    pub fn complete_work(&self, ticket: WorkTicket) -> Result<(), GateError> {
        let mut state = self.lock_state();
        if !state.holds(&ticket) {
            warn!(
                "Producer '{}' completed turn {} after it was closed (gate at turn {}); its late work was dropped",
                ticket.producer, ticket.turn, state.turn
            );
            return Err(state.stale(&ticket));
        }

        if let Some(count) = state.producers.get_mut(&ticket.producer) {
            *count -= 1;
            if *count == 0 {
                state.producers.remove(&ticket.producer);
            }
        }
        drop(state);
        self.signal();
        Ok(())
    }

    /// Runs `push` while the ticket is verified live, counting the record in flight
    /// when `push` reports that it was queued.
    pub(crate) fn admit<F>(&self, ticket: &WorkTicket, push: F) -> Result<(), GateError>
    where
        F: FnOnce() -> bool,
    {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(GateError::ShutDown);
        }
        if !state.holds(ticket) {
            return Err(state.stale(ticket));
        }
        if push() {
            state.in_flight += 1;
        }
        Ok(())
    }

    /// Marks one record of `turn` as broadcast. Records of earlier, force-closed
    /// turns are ignored.
    pub(crate) fn release_record(&self, turn: TurnNumber) {
        let mut state = self.lock_state();
        if turn != state.turn || state.in_flight == 0 {
            return;
        }
        state.in_flight -= 1;
        let settled = state.in_flight == 0;
        drop(state);
        if settled {
            self.signal();
        }
    }

    fn is_settled(&self, state: &GateState) -> bool {
        state.producers.is_empty() && (!self.wait_for_dispatch || state.in_flight == 0)
    }

    /// Suspends until every producer holding `turn` has completed.
    ///
    /// Bounded by the stall timeout, after which the turn is force-closed.
    pub async fn await_turn_complete(&self, turn: TurnNumber) -> Result<TurnOutcome, GateError> {
        let deadline = Instant::now() + self.stall_timeout;
        let mut changes = self.changes.subscribe();

        {
            let mut state = self.lock_state();
            if state.shut_down {
                return Ok(TurnOutcome::Shutdown);
            }
            if turn != state.turn {
                return Err(GateError::WrongTurn {
                    requested: turn,
                    current: state.turn,
                });
            }
            if state.phase == TurnPhase::Open {
                state.phase = TurnPhase::Draining;
            }
        }

        loop {
            changes.borrow_and_update();
            {
                let mut state = self.lock_state();
                if state.shut_down {
                    return Ok(TurnOutcome::Shutdown);
                }
                if self.is_settled(&state) {
                    state.phase = TurnPhase::Closed;
                    return Ok(TurnOutcome::Completed);
                }
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Ok(TurnOutcome::Shutdown),
                Err(_) => return Ok(self.force_close(turn)),
            }
        }
    }

    fn force_close(&self, turn: TurnNumber) -> TurnOutcome {
        let mut state = self.lock_state();
        if state.shut_down {
            return TurnOutcome::Shutdown;
        }
        if state.turn != turn || self.is_settled(&state) {
            state.phase = TurnPhase::Closed;
            return TurnOutcome::Completed;
        }

        let stalled: Vec<String> = state.producers.keys().cloned().collect();
        let undelivered = state.in_flight;
        if !stalled.is_empty() {
            warn!(
                "Turn {} stalled for {:?}; still held by: {}. Forcing advance",
                turn,
                self.stall_timeout,
                stalled.join(", ")
            );
        }
        if self.wait_for_dispatch && undelivered > 0 {
            warn!(
                "Turn {} closed with {} records not yet dispatched",
                turn, undelivered
            );
        }

        state.producers.clear();
        state.in_flight = 0;
        state.phase = TurnPhase::Closed;
        drop(state);
        self.signal();

        TurnOutcome::ForcedAdvance {
            stalled,
            undelivered,
        }
    }

    /// Advances the clock past a closed turn and opens the next one.
    pub fn advance(&self) -> Result<TurnNumber, GateError> {
        self.advance_with(|_| false)
    }

    /// Like [`advance`](Self::advance), but runs `push` for the new turn before
    /// any producer can register for it, so its record leads the turn.
    pub(crate) fn advance_with<F>(&self, push: F) -> Result<TurnNumber, GateError>
    where
        F: FnOnce(TurnNumber) -> bool,
    {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(GateError::ShutDown);
        }
        if state.phase != TurnPhase::Closed || !state.producers.is_empty() {
            return Err(GateError::InvariantViolation(format!(
                "advance requested while turn {} is {:?} with {} producers outstanding",
                state.turn,
                state.phase,
                state.producers.len()
            )));
        }
        let shown = self.clock.current_turn();
        if shown != state.turn {
            return Err(GateError::InvariantViolation(format!(
                "clock shows turn {} but gate holds turn {}",
                shown, state.turn
            )));
        }

        let next = self.clock.advance();
        if next != state.turn + 1 {
            return Err(GateError::InvariantViolation(format!(
                "clock moved from {} to {}",
                state.turn, next
            )));
        }

        state.turn = next;
        state.phase = TurnPhase::Open;
        state.in_flight = usize::from(push(next));
        drop(state);
        self.signal();
        Ok(next)
    }

    /// Rejects all further work and releases a waiting driver.
    pub fn shutdown(&self) {
        self.shutdown_with(|_| false);
    }

    /// Shuts down after running `push` for the current turn, so its record is
    /// the last one admitted. Returns false if the gate was already shut down.
    pub(crate) fn shutdown_with<F>(&self, push: F) -> bool
    where
        F: FnOnce(TurnNumber) -> bool,
    {
        let mut state = self.lock_state();
        if state.shut_down {
            return false;
        }
        if push(state.turn) {
            state.in_flight += 1;
        }
        state.shut_down = true;
        info!("Turn gate shutting down at turn {}", state.turn);
        drop(state);
        self.signal();
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock_state().shut_down
    }

    pub fn phase(&self) -> TurnPhase {
        self.lock_state().phase
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.lock_state();
        GateSnapshot {
            turn: state.turn,
            phase: state.phase,
            outstanding: state.producers.clone(),
            in_flight: state.in_flight,
            shut_down: state.shut_down,
        }
    }
}
