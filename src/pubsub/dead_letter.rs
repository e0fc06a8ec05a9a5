use std::{collections::VecDeque, fmt, sync::Arc, time::SystemTime};

use courier_error::{CourierResult, ErrorExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use super::{DeadLetterId, DeliveryRecord, IdGenerator, Message, SubscriptionId};

/// Почему доставка попала в dead-letter хранилище.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeadLetterReason {
    /// Исчерпаны все попытки (nack, таймаут ack или постановки).
    RetriesExhausted,
    /// Подписка удалена, пока доставка была в работе.
    SubscriberGone,
    /// Брокер остановлен до разрешения доставки.
    BrokerShutdown,
    /// Повтор запрошен для записи, уже исчерпавшей лимит попыток.
    InvariantViolation,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::SubscriberGone => "subscriber_gone",
            Self::BrokerShutdown => "broker_shutdown",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Запись dead-letter хранилища: сообщение, финальное состояние доставки
/// и причина.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub record: DeliveryRecord,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: SystemTime,
}

impl DeadLetterEntry {
    pub fn message(&self) -> &Message {
        &self.record.message
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.record.subscription_id
    }

    /// Номер последней попытки.
    pub fn attempts(&self) -> u32 {
        self.record.attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.record.last_error.as_deref()
    }
}

/// Внешнее хранилище dead-letter записей.
///
/// Брокер вызывает `append` при каждом попадании в dead-letter, `remove`
/// при `drain` и `requeue`, и `scan` один раз при старте, чтобы поднять
/// записи, оставшиеся от прошлого запуска.
pub trait DeadLetterStore: Send + Sync {
    fn append(
        &self,
        entry: &DeadLetterEntry,
    ) -> CourierResult<()>;

    fn remove(
        &self,
        ids: &[DeadLetterId],
    ) -> CourierResult<()>;

    fn scan(&self) -> CourierResult<Vec<DeadLetterEntry>>;
}

/// Хранилище в памяти. Переживает пересоздание брокера, если его `Arc`
/// передать в новый экземпляр.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn append(
        &self,
        entry: &DeadLetterEntry,
    ) -> CourierResult<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn remove(
        &self,
        ids: &[DeadLetterId],
    ) -> CourierResult<()> {
        self.entries.lock().retain(|e| !ids.contains(&e.id));
        Ok(())
    }

    fn scan(&self) -> CourierResult<Vec<DeadLetterEntry>> {
        Ok(self.entries.lock().clone())
    }
}

/// Dead-letter хранилище брокера: очередь в порядке попадания.
pub(crate) struct DeadLetterSink {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    ids: IdGenerator,
    store: Option<Arc<dyn DeadLetterStore>>,
}

impl DeadLetterSink {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ids: IdGenerator::starting_at(1),
            store: None,
        }
    }

    /// Поднимает записи из внешнего хранилища и продолжает писать в него.
    pub(crate) fn with_store(store: Arc<dyn DeadLetterStore>) -> CourierResult<Self> {
        let mut restored = store.scan()?;
        restored.sort_by_key(|e| e.id);

        let ids = IdGenerator::starting_at(1);
        if let Some(last) = restored.last() {
            ids.observe(last.id.get());
        }

        Ok(Self {
            entries: Mutex::new(restored.into()),
            ids,
            store: Some(store),
        })
    }

    /// Кладёт финальную запись доставки в хранилище.
    pub(crate) fn push(
        &self,
        record: DeliveryRecord,
        reason: DeadLetterReason,
    ) -> DeadLetterId {
        let entry = DeadLetterEntry {
            id: DeadLetterId(self.ids.next()),
            record,
            reason,
            dead_lettered_at: SystemTime::now(),
        };
        let id = entry.id;

        if let Some(store) = &self.store {
            if let Err(err) = store.append(&entry) {
                error!(
                    dead_letter_id = %id,
                    status = %err.status_code(),
                    error = %err,
                    "failed to persist dead letter, keeping it in memory only"
                );
            }
        }
        self.entries.lock().push_back(entry);
        id
    }

    /// Извлекает до `limit` самых старых записей.
    pub(crate) fn drain(
        &self,
        limit: usize,
    ) -> Vec<DeadLetterEntry> {
        let drained: Vec<DeadLetterEntry> = {
            let mut entries = self.entries.lock();
            let n = limit.min(entries.len());
            entries.drain(..n).collect()
        };
        self.forget(&drained.iter().map(|e| e.id).collect::<Vec<_>>());
        drained
    }

    /// Копии до `limit` самых старых записей без извлечения.
    pub(crate) fn peek(
        &self,
        limit: usize,
    ) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }

    pub(crate) fn get(
        &self,
        id: DeadLetterId,
    ) -> Option<DeadLetterEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Извлекает конкретную запись.
    pub(crate) fn take(
        &self,
        id: DeadLetterId,
    ) -> Option<DeadLetterEntry> {
        let taken = {
            let mut entries = self.entries.lock();
            let pos = entries.iter().position(|e| e.id == id)?;
            entries.remove(pos)
        };
        if taken.is_some() {
            self.forget(&[id]);
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn forget(
        &self,
        ids: &[DeadLetterId],
    ) {
        if ids.is_empty() {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(ids) {
                warn!(
                    count = ids.len(),
                    status = %err.status_code(),
                    error = %err,
                    "failed to remove dead letters from store"
                );
            }
        }
    }
}
