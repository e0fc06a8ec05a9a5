use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use courier_error::{
    CourierResult, PublishError, RecvError, RequeueError, SettleError, SubscribeError,
    TryRecvError,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use super::{
    dead_letter::DeadLetterSink, dispatcher::Dispatcher, registry::SubscriptionEntry,
    retry::run_scheduler, DeadLetterEntry, DeadLetterId, DeadLetterReason, DeadLetterStore,
    Delivery, DeliveryRecord, DeliveryState, DeliveryToken, MessageId, MetricsSnapshot,
    SubscriptionId, SubscriptionInfo, TopicPattern,
};
use crate::config::{BrokerConfig, SubscriptionConfig};

/// Итог остановки брокера.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Неразрешённых доставок в момент начала остановки.
    pub in_flight_at_start: usize,
    /// Сколько из них разрешилось за отведённое время.
    pub settled_during_grace: usize,
    /// Доставок, принудительно отправленных в dead-letter.
    pub forced_dead_letters: usize,
    /// `true`, если все доставки разрешились до истечения grace-периода.
    pub graceful: bool,
}

/// Внутрипроцессный pub/sub брокер с доставкой at-least-once.
///
/// Публикация раскладывает сообщение по почтовым ящикам всех подписок,
/// чей шаблон совпал с топиком. Подписчик забирает доставки через
/// [`receive`](Self::receive) и подтверждает их `ack`/`nack`; без
/// подтверждения за `ack_timeout` попытка считается неудачной. Неудачные
/// попытки повторяются с экспоненциальной задержкой, а исчерпавшие
/// лимит доставки попадают в dead-letter хранилище.
///
/// Создавать брокер нужно внутри Tokio runtime: конструктор запускает
/// фоновую задачу планировщика.
pub struct Broker {
    dispatcher: Arc<Dispatcher>,
    stop: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::start(config, DeadLetterSink::new())
    }

    /// Брокер, зеркалирующий dead-letter записи во внешнее хранилище.
    /// Записи прошлого запуска поднимаются через `scan`.
    pub fn with_store(
        config: BrokerConfig,
        store: Arc<dyn DeadLetterStore>,
    ) -> CourierResult<Self> {
        let sink = DeadLetterSink::with_store(store)?;
        let restored = sink.len();
        let broker = Self::start(config, sink);
        if restored > 0 {
            info!(restored, "dead letters restored from store");
        }
        Ok(broker)
    }

    fn start(
        config: BrokerConfig,
        sink: DeadLetterSink,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config, sink));
        let (stop, stop_rx) = watch::channel(false);
        let scheduler = tokio::spawn(run_scheduler(Arc::clone(&dispatcher), stop_rx));

        debug!(
            shards = dispatcher.registry.shard_count(),
            enqueue_timeout_ms = dispatcher.config.enqueue_timeout_ms,
            "broker started"
        );
        Self {
            dispatcher,
            stop,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Публикует сообщение в топик.
    ///
    /// Возвращает управление, когда сообщение разложено по ящикам всех
    /// совпавших подписок (или их доставки ушли в повтор). Публикация без
    /// подписчиков успешна, сообщение просто никому не достаётся.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<MessageId, PublishError> {
        self.dispatcher.publish(topic, payload.into()).await
    }

    /// Создаёт подписку на шаблон топиков.
    pub fn subscribe(
        &self,
        pattern: &str,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionId, SubscribeError> {
        if !self.dispatcher.is_accepting() {
            return Err(SubscribeError::ShuttingDown);
        }
        config.validate()?;
        let pattern = TopicPattern::parse(pattern)?;

        let entry = self.dispatcher.registry.register(pattern, config);
        info!(
            subscription_id = %entry.id,
            pattern = %entry.pattern,
            mailbox_capacity = entry.config.mailbox_capacity,
            max_attempts = entry.config.max_attempts,
            "subscription created"
        );
        Ok(entry.id)
    }

    /// Подписка с параметрами по умолчанию из [`BrokerConfig`].
    pub fn subscribe_with_defaults(
        &self,
        pattern: &str,
    ) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe(pattern, self.dispatcher.config.default_subscription.clone())
    }

    /// Удаляет подписку. Незавершённые доставки уходят в dead-letter с
    /// причиной `SubscriberGone`. Повторный вызов возвращает `false`.
    pub fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Ждёт следующую доставку подписки до `deadline`.
    pub async fn receive(
        &self,
        id: SubscriptionId,
        deadline: Instant,
    ) -> Result<Delivery, RecvError> {
        let entry = self.entry(id).ok_or(RecvError::SubscriptionClosed)?;
        loop {
            let delivery = entry.mailbox.recv(deadline).await?;
            if self.dispatcher.accept_received(&entry, &delivery) {
                return Ok(delivery);
            }
        }
    }

    pub async fn receive_timeout(
        &self,
        id: SubscriptionId,
        timeout: Duration,
    ) -> Result<Delivery, RecvError> {
        self.receive(id, Instant::now() + timeout).await
    }

    /// Как [`receive`](Self::receive), но ожидание прерывается, когда
    /// завершается `cancel`.
    pub async fn receive_until<F>(
        &self,
        id: SubscriptionId,
        deadline: Instant,
        cancel: F,
    ) -> Result<Delivery, RecvError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => Err(RecvError::Cancelled),
            received = self.receive(id, deadline) => received,
        }
    }

    /// Забирает доставку без ожидания.
    pub fn try_receive(
        &self,
        id: SubscriptionId,
    ) -> Result<Delivery, TryRecvError> {
        let entry = self.entry(id).ok_or(TryRecvError::SubscriptionClosed)?;
        loop {
            let delivery = entry.mailbox.try_recv()?;
            if self.dispatcher.accept_received(&entry, &delivery) {
                return Ok(delivery);
            }
        }
    }

    /// Подтверждает обработку. Повторный `ack` - no-op.
    pub fn ack(
        &self,
        token: DeliveryToken,
    ) -> Result<(), SettleError> {
        self.dispatcher.ack(token)
    }

    /// Отклоняет попытку: доставка будет повторена или уйдёт в dead-letter.
    pub fn nack(
        &self,
        token: DeliveryToken,
        reason: impl Into<String>,
    ) -> Result<(), SettleError> {
        self.dispatcher.nack(token, reason.into())
    }

    /// Извлекает до `limit` самых старых dead-letter записей.
    pub fn drain_dead_letters(
        &self,
        limit: usize,
    ) -> Vec<DeadLetterEntry> {
        self.dispatcher.dead_letters.drain(limit)
    }

    pub fn peek_dead_letters(
        &self,
        limit: usize,
    ) -> Vec<DeadLetterEntry> {
        self.dispatcher.dead_letters.peek(limit)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dispatcher.dead_letters.len()
    }

    /// Возвращает dead-letter запись в доставку с первой попытки.
    pub async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<(), RequeueError> {
        self.dispatcher.requeue(id).await
    }

    /// Текущее состояние доставки. `None`, если запись уже удалена
    /// (dead-letter или очищенный tombstone).
    pub fn delivery_state(
        &self,
        token: DeliveryToken,
    ) -> Option<DeliveryState> {
        self.dispatcher.tracker.state(token.key())
    }

    /// Копия записи доставки со счётчиком попыток и последней ошибкой.
    pub fn delivery_record(
        &self,
        token: DeliveryToken,
    ) -> Option<DeliveryRecord> {
        self.dispatcher.tracker.get(token.key())
    }

    pub fn subscription_info(
        &self,
        id: SubscriptionId,
    ) -> Option<SubscriptionInfo> {
        self.entry(id).map(|entry| entry.info())
    }

    pub fn subscription_count(&self) -> usize {
        self.dispatcher.registry.len()
    }

    /// Число неразрешённых доставок.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.tracker.in_flight()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics.snapshot()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.dispatcher.config
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.dispatcher.is_accepting()
    }

    /// Останавливает брокер.
    ///
    /// Новые публикации и подписки отклоняются сразу. Публикации, уже
    /// прошедшие проверку, дораскладываются (не дольше таймаута
    /// постановки). Затем начатые доставки получают до `grace` на
    /// разрешение (повторы продолжают работать), оставшиеся уходят в
    /// dead-letter с причиной `BrokerShutdown`. После этого
    /// останавливается планировщик и закрываются все почтовые ящики.
    pub async fn shutdown(
        &self,
        grace: Duration,
    ) -> ShutdownReport {
        if self.dispatcher.stop_accepting() {
            info!(grace_ms = grace.as_millis() as u64, "broker shutting down");
        }
        self.dispatcher.wait_admitted().await;

        let tracker = &self.dispatcher.tracker;
        let in_flight_at_start = tracker.in_flight();
        let graceful = time::timeout(grace, tracker.wait_idle()).await.is_ok();

        let forced = tracker.drain_in_flight();
        let forced_dead_letters = forced.len();
        for rec in forced {
            self.dispatcher
                .dead_letter(rec, DeadLetterReason::BrokerShutdown);
        }

        self.stop.send_replace(true);
        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(err) = handle.await {
                warn!(%err, "retry scheduler terminated abnormally");
            }
        }
        self.dispatcher.timers.clear();

        let closed = self.dispatcher.registry.drain();
        for entry in &closed {
            entry.mailbox.close();
        }

        let report = ShutdownReport {
            in_flight_at_start,
            settled_during_grace: in_flight_at_start.saturating_sub(forced_dead_letters),
            forced_dead_letters,
            graceful,
        };
        info!(
            in_flight_at_start,
            forced_dead_letters,
            graceful,
            subscriptions_closed = closed.len(),
            "broker stopped"
        );
        report
    }

    /// [`shutdown`](Self::shutdown) с grace-периодом из конфигурации.
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.dispatcher.config.shutdown_grace()).await
    }

    fn entry(
        &self,
        id: SubscriptionId,
    ) -> Option<Arc<SubscriptionEntry>> {
        self.dispatcher.registry.get(id)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.abort();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
