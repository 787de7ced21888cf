//! Sole consumer of the notification queue
//!
//! The dispatcher takes records in queue order and fans each one out to every
//! live session. It never touches the dungeon; its only side effects are
//! transport sends and session bookkeeping.

use crate::config::PipelineConfig;
use crate::notification_queue::NotificationReceiver;
use crate::session_registry::SessionRegistry;
use crate::transport::TransportError;
use crate::turn_gate::TurnGate;
use log::{debug, error, info, warn};
use shared::{Notification, Packet, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;

/// Result of fanning out one record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Sessions removed because of this broadcast.
    pub disconnected: Vec<SessionId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub records: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub disconnects: u64,
}

pub struct Dispatcher {
    receiver: NotificationReceiver,
    sessions: Arc<RwLock<SessionRegistry>>,
    gate: Arc<TurnGate>,
    send_timeout: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        receiver: NotificationReceiver,
        sessions: Arc<RwLock<SessionRegistry>>,
        gate: Arc<TurnGate>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            receiver,
            sessions,
            gate,
            send_timeout: config.send_timeout,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Broadcasts records until shutdown is signalled, then drains what is left.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DispatchStats {
        info!("Dispatcher started");

        loop {
            if *shutdown.borrow_and_update() {
                self.drain().await;
                break;
            }

            tokio::select! {
                biased;
                next = self.receiver.dequeue_blocking() => match next {
                    Some(notification) => {
                        self.broadcast(notification).await;
                    }
                    None => {
                        info!("Notification queue closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        self.drain().await;
                        break;
                    }
                }
            }
        }

        info!(
            "Dispatcher stopped after {} records ({} deliveries, {} failures, {} disconnects)",
            self.stats.records, self.stats.deliveries, self.stats.failures, self.stats.disconnects
        );
        self.stats
    }

    /// Sends whatever is still queued. Failures are logged and otherwise ignored.
    async fn drain(&mut self) {
        let mut drained = 0;
        while let Some(notification) = self.receiver.try_dequeue() {
            self.broadcast(notification).await;
            drained += 1;
        }
        if drained > 0 {
            info!("Dispatcher drained {} records on shutdown", drained);
        }
    }

    /// Sends one record to every live session.
    ///
    /// The record is encoded once. Sessions are snapshotted under the read lock
    /// and sent to without holding it, so a session removed mid-broadcast may
    /// still get this record but none after it.
    pub async fn broadcast(&mut self, notification: Notification) -> BroadcastReport {
        let turn = notification.turn;
        let sequence = notification.sequence;
        let mut report = BroadcastReport::default();
        self.stats.records += 1;

        let bytes = match Packet::Notification(notification).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode record {} of turn {}: {}", sequence, turn, e);
                self.gate.release_record(turn);
                return report;
            }
        };

        let targets = self.sessions.read().await.live_targets();
        let mut outcomes = Vec::with_capacity(targets.len());
        for (id, transport) in targets {
            let result = match timeout(self.send_timeout, transport.send(&bytes)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.send_timeout)),
            };
            if let Err(e) = &result {
                debug!("Send of record {} to {} failed: {}", sequence, transport.peer(), e);
            }
            outcomes.push((id, result));
        }

        {
            let mut sessions = self.sessions.write().await;
            for (id, result) in &outcomes {
                match result {
                    Ok(()) => {
                        sessions.record_delivery(*id, turn);
                        report.delivered += 1;
                    }
                    Err(e) => {
                        sessions.record_failure(*id, e);
                        report.failed += 1;
                    }
                }
            }
            report.disconnected = sessions.reap_disconnected();
        }

        if !report.disconnected.is_empty() {
            warn!(
                "Removed sessions {:?} after record {} of turn {}",
                report.disconnected, sequence, turn
            );
        }

        self.stats.deliveries += report.delivered as u64;
        self.stats.failures += report.failed as u64;
        self.stats.disconnects += report.disconnected.len() as u64;

        self.gate.release_record(turn);
        report
    }
}
