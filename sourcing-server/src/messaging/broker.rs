//! In-process message broker.
//!
//! One FIFO per queue. Every envelope is stamped with a broker-wide sequence
//! number on publish, so a consumer of several queues can take envelopes in
//! the order they were published. A requeued envelope gets a fresh number
//! and goes behind everything published before the requeue.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use sourcing_core::Envelope;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{ChannelError, EventChannel};

#[derive(Default)]
struct Queues {
    next_seq: u64,
    by_name: HashMap<String, VecDeque<(u64, Envelope)>>,
}

pub struct InMemoryBroker {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
        }
    }

    /// Pop the next envelope of `queue` without waiting.
    pub async fn try_receive(&self, queue: &str) -> Option<Envelope> {
        let mut queues = self.queues.lock().await;
        queues
            .by_name
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
            .map(|(_, envelope)| envelope)
    }

    /// Pop the earliest published envelope across `queues` without waiting.
    /// Returns the queue it was taken from.
    pub async fn try_receive_any<S: AsRef<str>>(&self, queues: &[S]) -> Option<(String, Envelope)> {
        let mut guard = self.queues.lock().await;
        let earliest = queues
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let (seq, _) = guard.by_name.get(name)?.front()?;
                Some((*seq, name))
            })
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, name)| name.to_string())?;
        let (_, envelope) = guard.by_name.get_mut(&earliest)?.pop_front()?;
        Some((earliest, envelope))
    }

    /// Wait for the next envelope of `queue`.
    pub async fn receive(&self, queue: &str) -> Envelope {
        loop {
            // Registered before the check so a publish in between is not missed.
            let notified = self.notify.notified();
            if let Some(envelope) = self.try_receive(queue).await {
                return envelope;
            }
            notified.await;
        }
    }

    /// Wait for the earliest published envelope across `queues`.
    pub async fn receive_any<S: AsRef<str>>(&self, queues: &[S]) -> (String, Envelope) {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_receive_any(queues).await {
                return delivery;
            }
            notified.await;
        }
    }

    /// Put an envelope back at the end of `queue` for redelivery.
    pub async fn requeue(&self, queue: &str, envelope: Envelope) {
        self.push(queue, envelope).await;
    }

    /// Number of envelopes waiting in `queue`.
    pub async fn len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.by_name.get(queue).map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }

    async fn push(&self, queue: &str, envelope: Envelope) {
        let mut queues = self.queues.lock().await;
        queues.next_seq += 1;
        let seq = queues.next_seq;
        queues
            .by_name
            .entry(queue.to_string())
            .or_default()
            .push_back((seq, envelope));
        drop(queues);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl EventChannel for InMemoryBroker {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError> {
        debug!(
            "Publishing {} ({}) to {}",
            envelope.message_type, envelope.message_id, queue
        );
        self.push(queue, envelope).await;
        Ok(())
    }
}
