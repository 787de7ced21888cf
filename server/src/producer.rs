//! Per-turn producer tasks
//!
//! A producer does a slice of simulation work once per turn and queues the
//! payloads describing what it changed. [`run_producer`] owns the gate
//! protocol around it: register for the open turn, produce, complete, then
//! sleep until the clock moves on.

use crate::notification_queue::{NotificationQueue, QueueError};
use crate::turn_gate::WorkTicket;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

#[async_trait]
pub trait TurnProducer: Send + 'static {
    /// Name the gate reports when this producer stalls.
    fn name(&self) -> &str;

    /// Does one turn of work and queues its records under `ticket`.
    ///
    /// Records must be queued before any lock guarding the state they describe
    /// is released, otherwise another producer's later change to the same
    /// entity can be queued first.
    async fn produce(
        &mut self,
        ticket: &WorkTicket,
        queue: &NotificationQueue,
    ) -> Result<usize, QueueError>;
}

/// Drives `producer` once per turn until shutdown.
pub async fn run_producer<P: TurnProducer>(
    mut producer: P,
    queue: NotificationQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    let gate = Arc::clone(queue.gate());
    let name = producer.name().to_string();
    info!("Producer '{}' started", name);

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let ticket = match gate.register_when_open(&name).await {
            Ok(ticket) => ticket,
            Err(e) => {
                debug!("Producer '{}' stopping: {}", name, e);
                break;
            }
        };
        let turn = ticket.turn();

        if let Err(e) = producer.produce(&ticket, &queue).await {
            warn!("Producer '{}' lost records for turn {}: {}", name, turn, e);
        }
        if gate.complete_work(ticket).is_err() {
            continue;
        }

        tokio::select! {
            _ = gate.clock().wait_for_turn_after(turn) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Producer '{}' stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::turn_clock::TurnClock;
    use crate::turn_gate::{TurnGate, TurnOutcome};
    use shared::{Payload, TurnNumber};
    use std::time::Duration;

    struct Counter {
        report: tokio::sync::mpsc::UnboundedSender<TurnNumber>,
    }

    #[async_trait]
    impl TurnProducer for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn produce(
            &mut self,
            ticket: &WorkTicket,
            queue: &NotificationQueue,
        ) -> Result<usize, QueueError> {
            let turn = ticket.turn();
            let _ = self.report.send(turn);
            queue.enqueue(
                ticket,
                Payload::Chat {
                    nick: "counter".to_string(),
                    message: turn.to_string(),
                },
            )?;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_producer_runs_once_per_turn() {
        let config = PipelineConfig::default().with_wait_for_dispatch(false);
        let gate = Arc::new(TurnGate::new(Arc::new(TurnClock::new()), &config));
        let (queue, mut receiver) = NotificationQueue::new(Arc::clone(&gate), 100);
        let (report, mut turns) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_producer(
            Counter { report },
            queue.clone(),
            shutdown_rx,
        ));

        for expected in 0..3 {
            let turn = tokio::time::timeout(Duration::from_secs(5), turns.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(turn, expected);

            let outcome = gate.await_turn_complete(expected).await.unwrap();
            assert_eq!(outcome, TurnOutcome::Completed);
            if expected < 2 {
                gate.advance().unwrap();
            }
        }

        shutdown_tx.send(true).unwrap();
        gate.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        while let Some(notification) = receiver.try_dequeue() {
            seen.push(notification.turn);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
