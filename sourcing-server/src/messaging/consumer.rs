//! Queue consumer with delivery counting and dead-lettering.
//!
//! A delivery that ends acked or dead-lettered is settled: its outbox row is
//! marked dispatched. A requeued delivery is not, so a restart publishes it
//! again.

use std::sync::Arc;

use chrono::Utc;
use sourcing_core::Envelope;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{DeadLetter, Dispatcher, HandlerError, InMemoryBroker};
use crate::repository::{DeadLetterRepository, OutboxRepository};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

pub struct Consumer {
    broker: Arc<InMemoryBroker>,
    dispatcher: Dispatcher,
    dead_letters: Arc<dyn DeadLetterRepository>,
    outbox: Arc<dyn OutboxRepository>,
    max_deliveries: u32,
}

impl Consumer {
    pub fn new(
        broker: Arc<InMemoryBroker>,
        dispatcher: Dispatcher,
        dead_letters: Arc<dyn DeadLetterRepository>,
        outbox: Arc<dyn OutboxRepository>,
        max_deliveries: u32,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            dead_letters,
            outbox,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Hand one envelope to its handler, then settle or requeue it.
    pub async fn deliver(&self, queue: &str, envelope: Envelope) -> DeliveryOutcome {
        let message_id = envelope.message_id;
        let outcome = self.attempt(queue, envelope).await;
        if outcome != DeliveryOutcome::Requeued {
            self.settle(message_id).await;
        }
        outcome
    }

    async fn attempt(&self, queue: &str, mut envelope: Envelope) -> DeliveryOutcome {
        envelope.delivery_count += 1;

        match self.dispatcher.dispatch(&envelope).await {
            Ok(()) => DeliveryOutcome::Acked,
            Err(HandlerError::Malformed(reason)) => {
                warn!(
                    "Rejecting malformed message {} on {} (correlation {}): {}",
                    envelope.message_id, queue, envelope.correlation_id, reason
                );
                self.dead_letter(queue, envelope, reason).await
            }
            Err(HandlerError::Transient(reason)) if envelope.delivery_count < self.max_deliveries => {
                warn!(
                    "Retrying message {} on {} after attempt {}/{} (correlation {}): {}",
                    envelope.message_id,
                    queue,
                    envelope.delivery_count,
                    self.max_deliveries,
                    envelope.correlation_id,
                    reason
                );
                self.broker.requeue(queue, envelope).await;
                DeliveryOutcome::Requeued
            }
            Err(HandlerError::Transient(reason)) => {
                error!(
                    "Giving up on message {} on {} after {} attempts (correlation {}): {}",
                    envelope.message_id,
                    queue,
                    envelope.delivery_count,
                    envelope.correlation_id,
                    reason
                );
                self.dead_letter(queue, envelope, reason).await
            }
        }
    }

    /// Deliver everything currently in `queue`, including redeliveries, and
    /// return the outcomes in order.
    pub async fn drain(&self, queue: &str) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        while let Some(envelope) = self.broker.try_receive(queue).await {
            outcomes.push(self.deliver(queue, envelope).await);
        }
        outcomes
    }

    /// Deliver everything currently in `queues` in publish order, including
    /// redeliveries.
    pub async fn drain_all(&self, queues: &[&str]) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        while let Some((queue, envelope)) = self.broker.try_receive_any(queues).await {
            outcomes.push(self.deliver(&queue, envelope).await);
        }
        outcomes
    }

    /// Consume `queues` forever, one delivery at a time, in publish order.
    ///
    /// A request's Withdrawn message is published after its Processing
    /// message, so it is never handled first. A Processing message that is
    /// being retried does move behind later messages.
    pub async fn run(self: Arc<Self>, queues: Vec<String>) {
        info!("Consumer started for {}", queues.join(", "));
        loop {
            let (queue, envelope) = self.broker.receive_any(&queues).await;
            self.deliver(&queue, envelope).await;
        }
    }

    async fn settle(&self, message_id: Uuid) {
        if let Err(e) = self.outbox.mark_dispatched(message_id).await {
            warn!(
                "Message {} was settled but stays pending in the outbox: {}",
                message_id, e
            );
        }
    }

    async fn dead_letter(&self, queue: &str, envelope: Envelope, reason: String) -> DeliveryOutcome {
        let letter = DeadLetter {
            queue: queue.to_string(),
            attempts: envelope.delivery_count,
            envelope,
            reason,
            dead_lettered_at: Utc::now(),
        };
        if let Err(e) = self.dead_letters.record_dead_letter(&letter).await {
            error!(
                "Failed to record dead letter {}: {}",
                letter.envelope.message_id, e
            );
        }
        DeliveryOutcome::DeadLettered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::messaging::{EventChannel, MessageHandler};
    use crate::repository::{Commit, InMemoryRepository, OutboxMessage, SourcingRepository};

    const QUEUE: &str = "test.queue";

    struct CountingHandler {
        calls: AtomicU32,
        result: Result<(), HandlerError>,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn envelope(message_type: &str) -> Envelope {
        Envelope {
            message_id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            correlation_id: "corr".to_string(),
            payload: "{}".to_string(),
            published_at: Utc::now(),
            delivery_count: 0,
        }
    }

    fn setup(
        result: Result<(), HandlerError>,
        max_deliveries: u32,
    ) -> (Consumer, Arc<InMemoryBroker>, Arc<InMemoryRepository>, Arc<CountingHandler>) {
        let broker = Arc::new(InMemoryBroker::new());
        let repo = Arc::new(InMemoryRepository::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            result,
        });
        let dispatcher = Dispatcher::new().bind("known", handler.clone());
        let consumer = Consumer::new(
            broker.clone(),
            dispatcher,
            repo.clone(),
            repo.clone(),
            max_deliveries,
        );
        (consumer, broker, repo, handler)
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked() {
        let (consumer, broker, repo, handler) = setup(Ok(()), 3);
        broker.publish(QUEUE, envelope("known")).await.unwrap();

        assert_eq!(consumer.drain(QUEUE).await, vec![DeliveryOutcome::Acked]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(repo.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_dead_lettered_immediately() {
        let (consumer, broker, repo, handler) = setup(Ok(()), 3);
        broker
            .publish(QUEUE, envelope("some.wrong.message.type"))
            .await
            .unwrap();

        assert_eq!(
            consumer.drain(QUEUE).await,
            vec![DeliveryOutcome::DeadLettered]
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let letters = repo.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].reason.contains("some.wrong.message.type"));
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let (consumer, broker, repo, handler) =
            setup(Err(HandlerError::Malformed("bad payload".into())), 5);
        broker.publish(QUEUE, envelope("known")).await.unwrap();

        assert_eq!(
            consumer.drain(QUEUE).await,
            vec![DeliveryOutcome::DeadLettered]
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered_up_to_threshold() {
        let (consumer, broker, repo, handler) =
            setup(Err(HandlerError::Transient("role service down".into())), 3);
        broker.publish(QUEUE, envelope("known")).await.unwrap();

        assert_eq!(
            consumer.drain(QUEUE).await,
            vec![
                DeliveryOutcome::Requeued,
                DeliveryOutcome::Requeued,
                DeliveryOutcome::DeadLettered,
            ]
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let letters = repo.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].queue, QUEUE);
    }

    /// Commit `envelope` to the outbox and publish it, the way the engine
    /// does.
    async fn publish_committed(
        broker: &InMemoryBroker,
        repo: &InMemoryRepository,
        queue: &str,
        envelope: Envelope,
    ) {
        repo.commit(Commit {
            outbox: vec![OutboxMessage {
                queue: queue.to_string(),
                envelope: envelope.clone(),
            }],
            ..Commit::default()
        })
        .await
        .unwrap();
        broker.publish(queue, envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_outbox_row_is_settled_only_when_delivery_ends() {
        let (consumer, broker, repo, _) =
            setup(Err(HandlerError::Transient("role service down".into())), 2);
        publish_committed(&broker, &repo, QUEUE, envelope("known")).await;

        let first = broker.try_receive(QUEUE).await.unwrap();
        assert_eq!(consumer.deliver(QUEUE, first).await, DeliveryOutcome::Requeued);
        assert_eq!(repo.pending_outbox().await.unwrap().len(), 1);

        let second = broker.try_receive(QUEUE).await.unwrap();
        assert_eq!(
            consumer.deliver(QUEUE, second).await,
            DeliveryOutcome::DeadLettered
        );
        assert!(repo.pending_outbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acked_delivery_settles_outbox_row() {
        let (consumer, broker, repo, _) = setup(Ok(()), 3);
        publish_committed(&broker, &repo, QUEUE, envelope("known")).await;
        assert_eq!(repo.pending_outbox().await.unwrap().len(), 1);

        assert_eq!(consumer.drain(QUEUE).await, vec![DeliveryOutcome::Acked]);
        assert!(repo.pending_outbox().await.unwrap().is_empty());
    }

    /// Records the message types it sees, in order.
    struct RecordingHandler {
        seen: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            self.seen.lock().await.push(envelope.message_type.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_single_consumer_handles_queues_in_publish_order() {
        let broker = Arc::new(InMemoryBroker::new());
        let repo = Arc::new(InMemoryRepository::new());
        let handler = Arc::new(RecordingHandler {
            seen: tokio::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new()
            .bind("processing", handler.clone())
            .bind("withdrawn", handler.clone());
        let consumer = Arc::new(Consumer::new(
            broker.clone(),
            dispatcher,
            repo.clone(),
            repo.clone(),
            3,
        ));

        broker
            .publish("q.processing", envelope("processing"))
            .await
            .unwrap();
        broker
            .publish("q.withdrawn", envelope("withdrawn"))
            .await
            .unwrap();

        // Listed withdrawn first; publish order still wins.
        let runner = tokio::spawn(
            consumer
                .clone()
                .run(vec!["q.withdrawn".to_string(), "q.processing".to_string()]),
        );
        for _ in 0..100 {
            if handler.seen.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        runner.abort();

        assert_eq!(
            *handler.seen.lock().await,
            vec!["processing".to_string(), "withdrawn".to_string()]
        );
    }
}
