use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Счётчики брокера. Обновляются без блокировок.
#[derive(Debug, Default)]
pub(crate) struct BrokerMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
    enqueue_timeouts: AtomicU64,
    ack_timeouts: AtomicU64,
    stale_skipped: AtomicU64,
    invariant_violations: AtomicU64,
}

/// Снимок счётчиков для экспорта.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Успешных вызовов `publish`.
    pub published: u64,
    /// Доставок, положенных в почтовые ящики (включая повторные).
    pub delivered: u64,
    /// Доставок, выданных подписчикам через `receive`.
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Запущенных повторных попыток.
    pub retried: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub enqueue_timeouts: u64,
    pub ack_timeouts: u64,
    /// Устаревших копий, пропущенных при получении.
    pub stale_skipped: u64,
    pub invariant_violations: u64,
}

macro_rules! counters {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl BrokerMetrics {
    counters! {
        record_publish => published,
        record_delivery => delivered,
        record_receive => received,
        record_ack => acked,
        record_nack => nacked,
        record_retry => retried,
        record_dead_letter => dead_lettered,
        record_requeue => requeued,
        record_enqueue_timeout => enqueue_timeouts,
        record_ack_timeout => ack_timeouts,
        record_stale_skip => stale_skipped,
        record_invariant_violation => invariant_violations,
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            published: load(&self.published),
            delivered: load(&self.delivered),
            received: load(&self.received),
            acked: load(&self.acked),
            nacked: load(&self.nacked),
            retried: load(&self.retried),
            dead_lettered: load(&self.dead_lettered),
            requeued: load(&self.requeued),
            enqueue_timeouts: load(&self.enqueue_timeouts),
            ack_timeouts: load(&self.ack_timeouts),
            stale_skipped: load(&self.stale_skipped),
            invariant_violations: load(&self.invariant_violations),
        }
    }
}
