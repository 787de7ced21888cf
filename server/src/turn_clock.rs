//! Process-wide simulation turn counter
//!
//! Readers call [`TurnClock::current_turn`] from any thread without blocking.
//! Only the turn driver advances the clock, and it does so through
//! [`TurnGate::advance`](crate::turn_gate::TurnGate::advance) so that the
//! increment happens under the gate lock. Every record enqueued for turn N is
//! therefore in the queue before any reader can observe N+1.

use shared::TurnNumber;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

#[derive(Debug)]
pub struct TurnClock {
    current: AtomicU64,
    /// Wakes producers that suspend until the next turn opens.
    published: watch::Sender<TurnNumber>,
}

impl TurnClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(turn: TurnNumber) -> Self {
        let (published, _) = watch::channel(turn);
        Self {
            current: AtomicU64::new(turn),
            published,
        }
    }

    pub fn current_turn(&self) -> TurnNumber {
        self.current.load(Ordering::Acquire)
    }

    /// Moves the clock forward by exactly one turn and returns the new turn.
    pub(crate) fn advance(&self) -> TurnNumber {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.published.send_replace(next);
        next
    }

    /// Suspends until the clock shows a turn later than `turn`.
    ///
    /// Returns immediately if the clock has already moved past it.
    pub async fn wait_for_turn_after(&self, turn: TurnNumber) -> TurnNumber {
        let mut rx = self.published.subscribe();
        loop {
            let seen = *rx.borrow_and_update();
            if seen > turn {
                return seen;
            }
            if rx.changed().await.is_err() {
                return self.current_turn();
            }
        }
    }
}

impl Default for TurnClock {
    fn default() -> Self {
        Self::new()
    }
}
