//! Ordered queue of notifications awaiting dispatch
//!
//! Producers hold cloneable [`NotificationQueue`] handles and append records
//! without ever blocking. Exactly one [`NotificationReceiver`] exists, owned by
//! the dispatcher, which suspends in [`NotificationReceiver::dequeue_blocking`]
//! while the queue is empty.
//!
//! Appends are admitted by the [`TurnGate`]: the producer's ticket must be live
//! for the open turn, and the sequence number is taken under the gate lock, so
//! queue order, sequence order and turn order all agree.

use crate::turn_gate::{GateError, TurnGate, WorkTicket};
use log::{debug, info, warn};
use shared::{Notification, Payload, TurnNumber};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("enqueue rejected by turn gate: {0}")]
    Gate(#[from] GateError),
    #[error("notification receiver has been dropped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub depth: u64,
    pub high_water: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    high_water: AtomicU64,
    under_pressure: AtomicBool,
}

impl Counters {
    fn depth(&self) -> u64 {
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let dequeued = self.dequeued.load(Ordering::Acquire);
        enqueued.saturating_sub(dequeued)
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Acquire),
            dequeued: self.dequeued.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Acquire),
            depth: self.depth(),
            high_water: self.high_water.load(Ordering::Acquire),
        }
    }
}

struct Shared {
    gate: Arc<TurnGate>,
    sender: mpsc::UnboundedSender<Notification>,
    next_sequence: AtomicU64,
    counters: Arc<Counters>,
    warn_depth: u64,
}

impl Shared {
    /// Stamps and sends one record. Must run under the gate lock.
    fn push(&self, turn: TurnNumber, payload: Payload) -> (u64, bool) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let notification = Notification {
            turn,
            sequence,
            payload,
        };
        let sent = self.sender.send(notification).is_ok();
        if sent {
            self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        }
        (sequence, sent)
    }
}

/// Producer handle. Clones share one underlying queue.
#[derive(Clone)]
pub struct NotificationQueue {
    shared: Arc<Shared>,
}

/// The single consumer end, owned by the dispatcher.
pub struct NotificationReceiver {
    receiver: mpsc::UnboundedReceiver<Notification>,
    counters: Arc<Counters>,
    warn_depth: u64,
}

impl NotificationQueue {
    pub fn new(gate: Arc<TurnGate>, warn_depth: usize) -> (Self, NotificationReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let warn_depth = warn_depth as u64;

        let queue = Self {
            shared: Arc::new(Shared {
                gate,
                sender,
                next_sequence: AtomicU64::new(1),
                counters: Arc::clone(&counters),
                warn_depth,
            }),
        };
        let receiver = NotificationReceiver {
            receiver,
            counters,
            warn_depth,
        };
        (queue, receiver)
    }

    /// Appends a record for the ticket's turn and returns its sequence number.
    ///
    /// The payload must already be an owned snapshot of the changed entity.
    pub fn enqueue(&self, ticket: &WorkTicket, payload: Payload) -> Result<u64, QueueError> {
        let shared = &self.shared;
        let mut sequence = 0;
        let mut delivered = false;

        let admitted = shared.gate.admit(ticket, || {
            let (assigned, sent) = shared.push(ticket.turn(), payload);
            sequence = assigned;
            delivered = sent;
            sent
        });

        if let Err(err) = admitted {
            shared.counters.rejected.fetch_add(1, Ordering::AcqRel);
            if let GateError::StaleTicket { .. } = err {
                warn!(
                    "Dropping record from '{}' for closed turn {}",
                    ticket.producer(),
                    ticket.turn()
                );
            }
            return Err(err.into());
        }
        if !delivered {
            shared.counters.rejected.fetch_add(1, Ordering::AcqRel);
            return Err(QueueError::Closed);
        }

        self.note_depth();
        Ok(sequence)
    }

    /// Appends several records in order, stopping at the first rejection.
    pub fn enqueue_all<I>(&self, ticket: &WorkTicket, payloads: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = Payload>,
    {
        let mut count = 0;
        for payload in payloads {
            self.enqueue(ticket, payload)?;
            count += 1;
        }
        Ok(count)
    }

    /// Enqueues `payloads` as a one-off producer in the next turn that accepts
    /// work, waiting out a draining turn if necessary.
    pub async fn publish(
        &self,
        producer: &str,
        payloads: Vec<Payload>,
    ) -> Result<usize, QueueError> {
        let gate = &self.shared.gate;
        let ticket = gate.register_when_open(producer).await?;
        let result = self.enqueue_all(&ticket, payloads);
        if let Err(e) = gate.complete_work(ticket) {
            debug!("Producer '{}' finished after its turn closed: {}", producer, e);
        }
        result
    }

    /// Advances the gate to the next turn and queues `opening` as that turn's
    /// first record, ahead of anything its producers enqueue.
    pub fn advance_and_announce<F>(&self, opening: F) -> Result<TurnNumber, QueueError>
    where
        F: FnOnce(TurnNumber) -> Payload,
    {
        let shared = &self.shared;
        let next = shared
            .gate
            .advance_with(|turn| shared.push(turn, opening(turn)).1)?;
        self.note_depth();
        Ok(next)
    }

    /// Shuts the gate and queues `last` as the final record of the session.
    ///
    /// Returns false if the gate had already shut down.
    pub fn close_with(&self, last: Payload) -> bool {
        let shared = &self.shared;
        let closed = shared.gate.shutdown_with(|turn| shared.push(turn, last).1);
        if closed {
            self.note_depth();
        }
        closed
    }

    fn note_depth(&self) {
        let counters = &self.shared.counters;
        let depth = counters.depth();
        counters.high_water.fetch_max(depth, Ordering::AcqRel);

        if depth >= self.shared.warn_depth && !counters.under_pressure.swap(true, Ordering::AcqRel)
        {
            warn!(
                "Notification queue depth {} reached warning level {}; dispatcher is falling behind",
                depth, self.shared.warn_depth
            );
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.counters.snapshot()
    }

    pub fn gate(&self) -> &Arc<TurnGate> {
        &self.shared.gate
    }
}

impl NotificationReceiver {
    /// Waits for the next record in enqueue order.
    ///
    /// Returns `None` once every producer handle has been dropped and the
    /// queue is empty.
    pub async fn dequeue_blocking(&mut self) -> Option<Notification> {
        let notification = self.receiver.recv().await;
        if notification.is_some() {
            self.note_dequeued();
        }
        notification
    }

    /// Takes the next record if one is already queued.
    pub fn try_dequeue(&mut self) -> Option<Notification> {
        let notification = self.receiver.try_recv().ok();
        if notification.is_some() {
            self.note_dequeued();
        }
        notification
    }

    fn note_dequeued(&self) {
        self.counters.dequeued.fetch_add(1, Ordering::AcqRel);
        let depth = self.counters.depth();
        if depth < self.warn_depth / 2 && self.counters.under_pressure.swap(false, Ordering::AcqRel)
        {
            info!("Notification queue drained back to {}", depth);
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}
