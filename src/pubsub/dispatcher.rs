use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use courier_error::{PublishError, RequeueError, SettleError};
use futures::future::join_all;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, error, info, trace, warn};

use super::{
    dead_letter::DeadLetterSink,
    mailbox::EnqueueError,
    metrics::BrokerMetrics,
    pattern::validate_topic,
    registry::{SubscriptionEntry, SubscriptionRegistry},
    retry::{Backoff, Timer, TimerKind, TimerQueue},
    tracker::{DeliveryTracker, FailureOutcome, RetryStart},
    DeadLetterId, DeadLetterReason, Delivery, DeliveryRecord, DeliveryToken, IdGenerator, Message,
    MessageId, SubscriptionId,
};
use crate::config::BrokerConfig;

const ENQUEUE_TIMEOUT_REASON: &str = "enqueue timeout";

/// Общее ядро брокера: реестр, трекер, таймеры и dead-letter хранилище.
///
/// Разделяется между фасадом [`Broker`](super::Broker), планировщиком
/// повторов и фоновыми задачами повторной доставки.
pub(crate) struct Dispatcher {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) timers: TimerQueue,
    pub(crate) dead_letters: DeadLetterSink,
    pub(crate) metrics: BrokerMetrics,
    backoff: Backoff,
    message_ids: IdGenerator,
    accepting: AtomicBool,
    /// Публикации и requeue держат read-guard на всё время раскладки;
    /// остановка берёт write-guard и так дожидается их завершения.
    admission: RwLock<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: BrokerConfig,
        dead_letters: DeadLetterSink,
    ) -> Self {
        let registry = SubscriptionRegistry::new(config.registry_shards);
        let message_ids = IdGenerator::starting_at(1);
        // записи, поднятые из хранилища, не должны пересечься с новыми id
        for entry in dead_letters.peek(usize::MAX) {
            message_ids.observe(entry.message().id.get());
            registry.observe_id(entry.subscription_id());
        }

        Self {
            registry,
            tracker: DeliveryTracker::new(),
            timers: TimerQueue::new(),
            dead_letters,
            metrics: BrokerMetrics::default(),
            backoff: Backoff::from_config(&config),
            message_ids,
            accepting: AtomicBool::new(true),
            admission: RwLock::new(()),
            config,
        }
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Закрывает приём публикаций и подписок. `true` при первом вызове.
    pub(crate) fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::AcqRel)
    }

    /// Ждёт завершения публикаций и requeue, прошедших проверку приёма
    /// до [`stop_accepting`](Self::stop_accepting).
    pub(crate) async fn wait_admitted(&self) {
        drop(self.admission.write().await);
    }

    /// Публикует сообщение всем совпавшим подписчикам.
    ///
    /// Возвращает управление, когда каждая доставка либо легла в ящик,
    /// либо получила свой исход (таймаут постановки, закрытый ящик).
    /// Медленный подписчик задерживает публикацию не дольше таймаута
    /// постановки: все ящики заполняются параллельно.
    pub(crate) async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> Result<MessageId, PublishError> {
        let _admitted = self.admission.read().await;
        if !self.is_accepting() {
            return Err(PublishError::ShuttingDown);
        }
        validate_topic(topic)?;

        let message = Arc::new(Message::new(
            MessageId(self.message_ids.next()),
            topic,
            payload,
        ));
        let id = message.id;
        self.metrics.record_publish();

        let targets = self.registry.matching(topic);
        if targets.is_empty() {
            trace!(message_id = %id, topic, "no matching subscriptions");
            return Ok(id);
        }

        let now = Instant::now();
        let deliveries: Vec<_> = targets
            .into_iter()
            .map(|entry| {
                let token = self
                    .tracker
                    .insert_pending(Arc::clone(&message), &entry, now);
                (entry, Delivery::new(Arc::clone(&message), token))
            })
            .collect();

        debug!(message_id = %id, topic, fan_out = deliveries.len(), "message published");
        join_all(
            deliveries
                .into_iter()
                .map(|(entry, delivery)| self.deliver(entry, delivery)),
        )
        .await;
        Ok(id)
    }

    /// Кладёт одну попытку в ящик подписчика и фиксирует исход.
    pub(crate) async fn deliver(
        &self,
        entry: Arc<SubscriptionEntry>,
        delivery: Delivery,
    ) {
        let token = delivery.token();
        match entry
            .mailbox
            .enqueue(delivery, self.config.enqueue_timeout())
            .await
        {
            Ok(()) => {
                self.metrics.record_delivery();
                let deadline = Instant::now() + entry.config.ack_timeout();
                if self.tracker.mark_delivered(token, deadline) {
                    self.timers.schedule(Timer::ack_deadline(deadline, token));
                }
            }
            Err(EnqueueError::Timeout) => {
                self.metrics.record_enqueue_timeout();
                warn!(
                    subscription_id = %token.subscription_id,
                    message_id = %token.message_id,
                    attempt = token.attempt,
                    queued = entry.mailbox.len(),
                    capacity = entry.mailbox.capacity(),
                    "mailbox full, enqueue timed out"
                );
                match self
                    .tracker
                    .fail(token, ENQUEUE_TIMEOUT_REASON, Instant::now(), &self.backoff)
                {
                    Ok(outcome) => self.apply_failure(outcome),
                    Err(err) => trace!(%err, "delivery settled while enqueue was waiting"),
                }
            }
            Err(EnqueueError::Closed) => {
                if let Some(rec) = self
                    .tracker
                    .take_for_dead_letter(token.key(), Some(token.attempt))
                {
                    self.dead_letter(rec, DeadLetterReason::SubscriberGone);
                }
            }
        }
    }

    /// Решает, выдавать ли полученную из ящика доставку подписчику.
    /// Устаревшие копии (попытка уже разрешена или заменена) пропускаются.
    pub(crate) fn accept_received(
        &self,
        entry: &SubscriptionEntry,
        delivery: &Delivery,
    ) -> bool {
        let token = delivery.token();
        let deadline = Instant::now() + entry.config.ack_timeout();
        if self.tracker.mark_received(token, deadline) {
            self.metrics.record_receive();
            self.timers.schedule(Timer::ack_deadline(deadline, token));
            return true;
        }

        self.metrics.record_stale_skip();
        trace!(
            subscription_id = %token.subscription_id,
            message_id = %token.message_id,
            attempt = token.attempt,
            "skipping stale delivery copy"
        );
        false
    }

    pub(crate) fn ack(
        &self,
        token: DeliveryToken,
    ) -> Result<(), SettleError> {
        if self.tracker.ack(token, Instant::now())? {
            self.metrics.record_ack();
            trace!(
                subscription_id = %token.subscription_id,
                message_id = %token.message_id,
                attempt = token.attempt,
                "delivery acked"
            );
        }
        Ok(())
    }

    pub(crate) fn nack(
        &self,
        token: DeliveryToken,
        reason: String,
    ) -> Result<(), SettleError> {
        let outcome = self
            .tracker
            .fail(token, reason, Instant::now(), &self.backoff)?;
        if !matches!(outcome, FailureOutcome::Ignored) {
            self.metrics.record_nack();
            debug!(
                subscription_id = %token.subscription_id,
                message_id = %token.message_id,
                attempt = token.attempt,
                "delivery nacked"
            );
        }
        self.apply_failure(outcome);
        Ok(())
    }

    /// Обрабатывает созревший таймер.
    pub(crate) fn fire(
        self: &Arc<Self>,
        timer: Timer,
        now: Instant,
    ) {
        match timer.kind {
            TimerKind::AckDeadline => {
                let outcome = self
                    .tracker
                    .expire_ack(timer.key, timer.attempt, now, &self.backoff);
                if !matches!(outcome, FailureOutcome::Ignored) {
                    self.metrics.record_ack_timeout();
                    debug!(
                        subscription_id = %timer.key.subscription_id,
                        message_id = %timer.key.message_id,
                        attempt = timer.attempt,
                        "ack deadline expired"
                    );
                }
                self.apply_failure(outcome);
            }
            TimerKind::Retry => self.start_retry(timer, now),
        }
    }

    fn start_retry(
        self: &Arc<Self>,
        timer: Timer,
        now: Instant,
    ) {
        let Some(entry) = self.registry.get(timer.key.subscription_id) else {
            if let Some(rec) = self
                .tracker
                .take_for_dead_letter(timer.key, Some(timer.attempt))
            {
                self.dead_letter(rec, DeadLetterReason::SubscriberGone);
            }
            return;
        };

        match self.tracker.begin_retry(timer.key, timer.attempt, now) {
            RetryStart::Ready(delivery) => {
                self.metrics.record_retry();
                trace!(
                    subscription_id = %timer.key.subscription_id,
                    message_id = %timer.key.message_id,
                    attempt = delivery.attempt(),
                    "redelivering"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move { this.deliver(entry, delivery).await });
            }
            RetryStart::Exhausted(rec) => {
                self.dead_letter(rec, DeadLetterReason::RetriesExhausted);
            }
            RetryStart::Overrun(rec) => {
                self.metrics.record_invariant_violation();
                error!(
                    subscription_id = %rec.subscription_id,
                    message_id = %rec.message.id,
                    attempt = rec.attempt,
                    max_attempts = rec.max_attempts,
                    "retry requested beyond max attempts"
                );
                self.dead_letter(rec, DeadLetterReason::InvariantViolation);
            }
            RetryStart::Stale => {}
        }
    }

    fn apply_failure(
        &self,
        outcome: FailureOutcome,
    ) {
        match outcome {
            FailureOutcome::Scheduled { key, at, attempt } => {
                self.timers.schedule(Timer::retry(at, key, attempt));
            }
            FailureOutcome::Ignored => {}
        }
    }

    pub(crate) fn dead_letter(
        &self,
        record: DeliveryRecord,
        reason: DeadLetterReason,
    ) -> DeadLetterId {
        self.metrics.record_dead_letter();
        let subscription_id = record.subscription_id;
        let message_id = record.message.id;
        let attempt = record.attempt;
        let id = self.dead_letters.push(record, reason);
        warn!(
            dead_letter_id = %id,
            %subscription_id,
            %message_id,
            attempt,
            %reason,
            "delivery dead-lettered"
        );
        id
    }

    /// Удаляет подписку, закрывает её ящик и переносит незавершённые
    /// доставки в dead-letter.
    pub(crate) fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            return false;
        };
        entry.mailbox.close();

        let orphaned = self.tracker.remove_subscription(id);
        let count = orphaned.len();
        for rec in orphaned {
            self.dead_letter(rec, DeadLetterReason::SubscriberGone);
        }
        info!(
            subscription_id = %id,
            pattern = %entry.pattern,
            dead_lettered = count,
            "subscription removed"
        );
        true
    }

    /// Возвращает dead-letter запись в доставку той же подписке с
    /// первой попытки.
    pub(crate) async fn requeue(
        &self,
        id: DeadLetterId,
    ) -> Result<(), RequeueError> {
        let _admitted = self.admission.read().await;
        if !self.is_accepting() {
            return Err(RequeueError::ShuttingDown);
        }

        let not_found = RequeueError::NotFound { entry_id: id.get() };
        let subscription_id = self
            .dead_letters
            .get(id)
            .ok_or_else(|| not_found.clone())?
            .subscription_id();
        let entry = self
            .registry
            .get(subscription_id)
            .ok_or(RequeueError::SubscriberGone {
                subscription_id: subscription_id.get(),
            })?;
        let dead = self.dead_letters.take(id).ok_or(not_found)?;

        let message = Arc::clone(&dead.record.message);
        let token = self
            .tracker
            .insert_pending(Arc::clone(&message), &entry, Instant::now());
        self.metrics.record_requeue();
        info!(
            dead_letter_id = %id,
            %subscription_id,
            message_id = %message.id,
            "dead letter requeued"
        );

        self.deliver(entry, Delivery::new(message, token)).await;
        Ok(())
    }
}
