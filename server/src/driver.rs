//! Turn driver
//!
//! Closes one turn per tick: waits for the gate to settle, optionally holds
//! back for slow clients, then advances the clock and announces the new turn.

use crate::config::PipelineConfig;
use crate::game_session::SessionError;
use crate::notification_queue::{NotificationQueue, QueueError};
use crate::session_registry::SessionRegistry;
use crate::turn_gate::{GateError, TurnOutcome};
use log::{debug, error, info, warn};
use shared::{Payload, TurnNumber};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// What happened to one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub closed: TurnNumber,
    pub opened: TurnNumber,
    pub outcome: TurnOutcome,
}

pub struct TurnDriver {
    queue: NotificationQueue,
    sessions: Arc<RwLock<SessionRegistry>>,
    config: PipelineConfig,
    forced_advances: u64,
}

impl TurnDriver {
    pub fn new(
        queue: NotificationQueue,
        sessions: Arc<RwLock<SessionRegistry>>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            queue,
            sessions,
            config: config.clone(),
            forced_advances: 0,
        }
    }

    /// Closes the open turn and opens the next one.
    ///
    /// Returns `None` once the gate has shut down.
    pub async fn step(&mut self) -> Result<Option<TurnReport>, SessionError> {
        let gate = Arc::clone(self.queue.gate());
        let turn = gate.clock().current_turn();

        let outcome = match gate.await_turn_complete(turn).await {
            Ok(TurnOutcome::Shutdown) => return Ok(None),
            Ok(outcome) => outcome,
            Err(e) => return Err(self.corrupted(e)),
        };
        if let TurnOutcome::ForcedAdvance { .. } = outcome {
            self.forced_advances += 1;
        }

        self.hold_for_slow_clients(turn).await;

        let turns_per_second = self.config.turns_per_second;
        let opened = match self
            .queue
            .advance_and_announce(|_| Payload::TurnStarted { turns_per_second })
        {
            Ok(opened) => opened,
            Err(QueueError::Gate(GateError::ShutDown)) | Err(QueueError::Closed) => return Ok(None),
            Err(QueueError::Gate(e)) => return Err(self.corrupted(e)),
        };

        Ok(Some(TurnReport {
            closed: turn,
            opened,
            outcome,
        }))
    }

    /// Steps once per turn period until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut ticker = interval(self.config.turn_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        info!(
            "Turn driver started at {:.2} turns per second",
            self.config.turns_per_second
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.step().await? {
                Some(report) => {
                    if report.opened % 60 == 0 {
                        self.log_stats(report.opened).await;
                    }
                }
                None => break,
            }
        }

        info!(
            "Turn driver stopped at turn {}",
            self.queue.gate().clock().current_turn()
        );
        Ok(())
    }

    /// Delays the advance while the slowest active client trails too far behind.
    async fn hold_for_slow_clients(&self, turn: TurnNumber) {
        let Some(max_lag) = self.config.max_client_turn_lag else {
            return;
        };
        let deadline = Instant::now() + self.config.backpressure_timeout;

        loop {
            let slowest = self.sessions.read().await.slowest_active_ack();
            let Some(acked) = slowest else {
                return;
            };
            if turn.saturating_sub(acked) <= max_lag {
                return;
            }
            if Instant::now() >= deadline || self.queue.gate().is_shut_down() {
                warn!(
                    "Slowest client is at turn {} ({} behind); advancing past turn {} anyway",
                    acked,
                    turn - acked,
                    turn
                );
                return;
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
    }

    async fn log_stats(&self, turn: TurnNumber) {
        let sessions = self.sessions.read().await.len();
        let stats = self.queue.stats();
        debug!(
            "Turn {}: {} sessions, queue depth {} (high water {}), {} records, {} forced advances",
            turn, sessions, stats.depth, stats.high_water, stats.enqueued, self.forced_advances
        );
    }

    /// Logs the gate state and stops the gate. The session cannot continue.
    fn corrupted(&self, err: GateError) -> SessionError {
        let gate = self.queue.gate();
        let state = format!("{:#?}", gate.snapshot());
        error!("Turn state corrupted: {}\n{}", err, state);
        gate.shutdown();
        SessionError::Corrupted {
            reason: err.to_string(),
            state,
        }
    }
}
