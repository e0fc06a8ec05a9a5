//! Учёт попыток доставки.
//!
//! На каждую пару (сообщение, подписка) заводится [`DeliveryRecord`],
//! который проходит по автомату состояний:
//!
//! ```text
//! Pending -> Delivered -> Acked
//!    |           |
//!    +-----------+-> Nacked -> Retrying -> Pending (attempt + 1)
//!                       |
//!                       +-> DeadLettered (attempt == max_attempts)
//! ```
//!
//! Последняя неудача не уводит запись в dead-letter сразу: запись
//! остаётся `Nacked` ещё на одну задержку backoff-а, и только таймер
//! переводит её в `DeadLettered`.
//!
//! Терминальные состояния: `Acked` и `DeadLettered`. Подтверждённые
//! записи остаются tombstone-ами, чтобы повторный `ack` был no-op;
//! dead-lettered записи сразу переезжают в dead-letter хранилище.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use courier_error::SettleError;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use tokio::{sync::Notify, time::Instant};

use super::{
    registry::SubscriptionEntry,
    retry::{Backoff, Timer, TimerKind},
    Delivery, DeliveryKey, DeliveryToken, Message, SubscriptionId,
};

pub(crate) const ACK_TIMEOUT_REASON: &str = "ack timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeliveryState {
    /// Ждёт места в почтовом ящике.
    Pending,
    /// Лежит в ящике или выдано подписчику, ждёт ack/nack.
    Delivered,
    Acked,
    Nacked,
    /// Ждёт срока следующей попытки.
    Retrying,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::DeadLettered)
    }

    /// Попытка ещё не разрешена подписчиком.
    fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Delivered)
    }
}

/// Состояние доставки одного сообщения одной подписке.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub message: Arc<Message>,
    pub subscription_id: SubscriptionId,
    /// Номер текущей попытки, `1..=max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: DeliveryState,
    pub next_retry_at: Option<Instant>,
    pub ack_deadline: Option<Instant>,
    pub last_error: Option<String>,
    pub updated_at: Instant,
}

impl DeliveryRecord {
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey {
            message_id: self.message.id,
            subscription_id: self.subscription_id,
        }
    }

    pub fn token(&self) -> DeliveryToken {
        self.key().token(self.attempt)
    }
}

/// Итог неуспешной попытки (nack, таймаут ack или постановки).
#[derive(Debug)]
pub(crate) enum FailureOutcome {
    /// В `at` запись либо получит следующую попытку, либо, если попытки
    /// исчерпаны, уйдёт в dead-letter.
    Scheduled {
        key: DeliveryKey,
        at: Instant,
        attempt: u32,
    },
    /// Устаревшая или повторная отметка, состояние не изменилось.
    Ignored,
}

/// Итог срабатывания таймера повтора.
#[derive(Debug)]
pub(crate) enum RetryStart {
    Ready(Delivery),
    /// Выдержана задержка после последней попытки, запись снята.
    Exhausted(DeliveryRecord),
    /// Запись в `Retrying`, хотя попыток больше не осталось.
    Overrun(DeliveryRecord),
    Stale,
}

/// Таблица записей доставки.
///
/// Все переходы выполняются под блокировкой шарда `DashMap`, поэтому
/// переход для одного ключа атомарен, а разные ключи не мешают друг другу.
pub(crate) struct DeliveryTracker {
    records: DashMap<DeliveryKey, DeliveryRecord>,
    in_flight: AtomicUsize,
    idle: Notify,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl DeliveryTracker {
    pub(crate) fn new() -> Self {
        Self {
            records: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Заводит запись первой попытки и возвращает её квитанцию.
    pub(crate) fn insert_pending(
        &self,
        message: Arc<Message>,
        subscription: &SubscriptionEntry,
        now: Instant,
    ) -> DeliveryToken {
        let record = DeliveryRecord {
            message,
            subscription_id: subscription.id,
            attempt: 1,
            max_attempts: subscription.config.max_attempts,
            state: DeliveryState::Pending,
            next_retry_at: None,
            ack_deadline: None,
            last_error: None,
            updated_at: now,
        };
        let token = record.token();

        match self.records.insert(token.key(), record) {
            Some(prev) if !prev.state.is_terminal() => {}
            _ => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }
        token
    }

    /// Pending -> Delivered после постановки в ящик. Возвращает `false`,
    /// если получатель успел забрать доставку раньше или запись ушла.
    pub(crate) fn mark_delivered(
        &self,
        token: DeliveryToken,
        ack_deadline: Instant,
    ) -> bool {
        let Some(mut rec) = self.records.get_mut(&token.key()) else {
            return false;
        };
        if rec.state != DeliveryState::Pending || rec.attempt != token.attempt {
            return false;
        }
        rec.state = DeliveryState::Delivered;
        rec.ack_deadline = Some(ack_deadline);
        true
    }

    /// Отмечает выдачу подписчику и продлевает срок ack.
    ///
    /// `false` означает устаревшую копию: попытка уже разрешена или
    /// заменена более новой, выдавать её не нужно.
    pub(crate) fn mark_received(
        &self,
        token: DeliveryToken,
        ack_deadline: Instant,
    ) -> bool {
        let Some(mut rec) = self.records.get_mut(&token.key()) else {
            return false;
        };
        if !rec.state.is_outstanding() || rec.attempt != token.attempt {
            return false;
        }
        rec.state = DeliveryState::Delivered;
        rec.ack_deadline = Some(ack_deadline);
        true
    }

    /// Подтверждение. Повторный ack - no-op; ack неизвестной или
    /// dead-lettered записи - ошибка. `Ok(true)`, если запись перешла в
    /// `Acked` именно этим вызовом.
    pub(crate) fn ack(
        &self,
        token: DeliveryToken,
        now: Instant,
    ) -> Result<bool, SettleError> {
        let Some(mut rec) = self.records.get_mut(&token.key()) else {
            return Err(already_terminal(token));
        };
        let state = rec.state;
        match state {
            DeliveryState::Acked => Ok(false),
            DeliveryState::DeadLettered => Err(already_terminal(token)),
            _ => {
                rec.state = DeliveryState::Acked;
                rec.ack_deadline = None;
                rec.next_retry_at = None;
                rec.updated_at = now;
                drop(rec);
                self.settle_one();
                Ok(true)
            }
        }
    }

    /// Неуспех текущей попытки: повтор с backoff-ом или dead-letter.
    ///
    /// Повторный или устаревший nack игнорируется.
    pub(crate) fn fail(
        &self,
        token: DeliveryToken,
        reason: impl Into<String>,
        now: Instant,
        backoff: &Backoff,
    ) -> Result<FailureOutcome, SettleError> {
        let Entry::Occupied(mut entry) = self.records.entry(token.key()) else {
            return Err(already_terminal(token));
        };

        let rec = entry.get();
        if rec.state.is_terminal() {
            return Err(already_terminal(token));
        }
        if !rec.state.is_outstanding() || rec.attempt != token.attempt {
            return Ok(FailureOutcome::Ignored);
        }

        Ok(schedule_retry(entry.get_mut(), reason.into(), now, backoff))
    }

    /// Срабатывание таймера ack. Если срок был продлён получением или
    /// попытка уже разрешена, ничего не делает.
    pub(crate) fn expire_ack(
        &self,
        key: DeliveryKey,
        attempt: u32,
        now: Instant,
        backoff: &Backoff,
    ) -> FailureOutcome {
        let Entry::Occupied(mut entry) = self.records.entry(key) else {
            return FailureOutcome::Ignored;
        };

        let rec = entry.get();
        let expired = rec.state == DeliveryState::Delivered
            && rec.attempt == attempt
            && rec.ack_deadline.is_some_and(|deadline| deadline <= now);
        if !expired {
            return FailureOutcome::Ignored;
        }

        schedule_retry(entry.get_mut(), ACK_TIMEOUT_REASON.into(), now, backoff)
    }

    /// Retrying -> Pending со следующим номером попытки, либо
    /// Nacked -> DeadLettered после последней попытки.
    pub(crate) fn begin_retry(
        &self,
        key: DeliveryKey,
        attempt: u32,
        now: Instant,
    ) -> RetryStart {
        let Entry::Occupied(mut entry) = self.records.entry(key) else {
            return RetryStart::Stale;
        };

        let rec = entry.get();
        if rec.attempt != attempt {
            return RetryStart::Stale;
        }
        let last = rec.attempt >= rec.max_attempts;
        match (rec.state, last) {
            (DeliveryState::Nacked, true) => {
                return RetryStart::Exhausted(self.finish_dead_letter(entry.remove()));
            }
            (DeliveryState::Retrying, true) => {
                return RetryStart::Overrun(self.finish_dead_letter(entry.remove()));
            }
            (DeliveryState::Retrying, false) => {}
            _ => return RetryStart::Stale,
        }

        let rec = entry.get_mut();
        rec.attempt += 1;
        rec.state = DeliveryState::Pending;
        rec.next_retry_at = None;
        rec.updated_at = now;
        RetryStart::Ready(Delivery::new(Arc::clone(&rec.message), rec.token()))
    }

    /// Снимает неразрешённую запись для dead-letter (подписчик ушёл).
    /// При `attempt = Some(n)` снимает только запись этой попытки.
    pub(crate) fn take_for_dead_letter(
        &self,
        key: DeliveryKey,
        attempt: Option<u32>,
    ) -> Option<DeliveryRecord> {
        let removed = self.records.remove_if(&key, |_, rec| {
            !rec.state.is_terminal() && attempt.map_or(true, |n| rec.attempt == n)
        });
        removed.map(|(_, rec)| self.finish_dead_letter(rec))
    }

    /// Снимает все записи подписки. Неразрешённые возвращаются для
    /// dead-letter, tombstone-ы просто удаляются.
    pub(crate) fn remove_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Vec<DeliveryRecord> {
        let keys: Vec<DeliveryKey> = self
            .records
            .iter()
            .filter(|r| r.key().subscription_id == subscription_id)
            .map(|r| *r.key())
            .collect();

        self.take_keys(keys)
    }

    /// Снимает все неразрешённые записи (принудительная остановка).
    pub(crate) fn drain_in_flight(&self) -> Vec<DeliveryRecord> {
        let keys: Vec<DeliveryKey> = self
            .records
            .iter()
            .filter(|r| !r.value().state.is_terminal())
            .map(|r| *r.key())
            .collect();

        self.take_keys(keys)
    }

    fn take_keys(
        &self,
        keys: Vec<DeliveryKey>,
    ) -> Vec<DeliveryRecord> {
        let mut taken = Vec::new();
        for key in keys {
            if let Some((_, rec)) = self.records.remove(&key) {
                if !rec.state.is_terminal() {
                    taken.push(self.finish_dead_letter(rec));
                }
            }
        }
        taken.sort_by_key(|rec| rec.message.id);
        taken
    }

    /// Удаляет tombstone-ы подтверждённых записей старше `cutoff`.
    pub(crate) fn purge_tombstones(
        &self,
        cutoff: Instant,
    ) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, rec| !(rec.state == DeliveryState::Acked && rec.updated_at <= cutoff));
        before.saturating_sub(self.records.len())
    }

    pub(crate) fn get(
        &self,
        key: DeliveryKey,
    ) -> Option<DeliveryRecord> {
        self.records.get(&key).map(|r| r.value().clone())
    }

    pub(crate) fn state(
        &self,
        key: DeliveryKey,
    ) -> Option<DeliveryState> {
        self.records.get(&key).map(|r| r.state)
    }

    /// `true`, если таймер ещё может изменить запись. Таймеры
    /// разрешённых, заменённых или продлённых попыток не нужны.
    pub(crate) fn expects(
        &self,
        timer: &Timer,
    ) -> bool {
        let Some(rec) = self.records.get(&timer.key) else {
            return false;
        };
        if rec.attempt != timer.attempt {
            return false;
        }
        match timer.kind {
            TimerKind::AckDeadline => {
                rec.state == DeliveryState::Delivered && rec.ack_deadline == Some(timer.at)
            }
            TimerKind::Retry => {
                matches!(rec.state, DeliveryState::Retrying | DeliveryState::Nacked)
                    && rec.next_retry_at == Some(timer.at)
            }
        }
    }

    /// Число неразрешённых записей.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ждёт, пока все записи не станут терминальными.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_dead_letter(
        &self,
        mut rec: DeliveryRecord,
    ) -> DeliveryRecord {
        rec.state = DeliveryState::DeadLettered;
        rec.next_retry_at = None;
        rec.ack_deadline = None;
        self.settle_one();
        rec
    }

    fn settle_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Nacked -> Retrying. На последней попытке запись остаётся `Nacked`
/// до срабатывания таймера.
fn schedule_retry(
    rec: &mut DeliveryRecord,
    reason: String,
    now: Instant,
    backoff: &Backoff,
) -> FailureOutcome {
    let at = now + backoff.delay(rec.attempt);
    rec.state = if rec.attempt >= rec.max_attempts {
        DeliveryState::Nacked
    } else {
        DeliveryState::Retrying
    };
    rec.last_error = Some(reason);
    rec.ack_deadline = None;
    rec.next_retry_at = Some(at);
    rec.updated_at = now;

    FailureOutcome::Scheduled {
        key: rec.key(),
        at,
        attempt: rec.attempt,
    }
}

fn already_terminal(token: DeliveryToken) -> SettleError {
    SettleError::AlreadyTerminal {
        message_id: token.message_id.get(),
        subscription_id: token.subscription_id.get(),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
