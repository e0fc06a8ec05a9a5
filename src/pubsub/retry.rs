use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{watch, Notify},
    time::{self, Instant},
};
use tracing::{debug, trace};

use super::{dispatcher::Dispatcher, DeliveryKey, DeliveryToken};
use crate::config::BrokerConfig;

/// Экспоненциальная задержка между попытками с симметричным jitter-ом.
///
/// `delay(n) = min(base * 2^(n-1), max) * (1 ± jitter)`, где `n` - номер
/// только что неудавшейся попытки.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(
        base: Duration,
        max: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.retry_base_delay(),
            config.retry_max_delay(),
            config.retry_jitter,
        )
    }

    /// Задержка без jitter-а.
    pub fn base_delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64(1.0 + spread)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TimerKind {
    /// Срок следующей попытки.
    Retry,
    /// Срок ack для выданной попытки.
    AckDeadline,
}

/// Отложенное событие для записи доставки.
///
/// Таймеры не отменяются: при срабатывании трекер проверяет, что запись
/// всё ещё в ожидаемом состоянии и на той же попытке.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Timer {
    pub(crate) at: Instant,
    pub(crate) key: DeliveryKey,
    pub(crate) attempt: u32,
    pub(crate) kind: TimerKind,
}

impl Timer {
    pub(crate) fn retry(
        at: Instant,
        key: DeliveryKey,
        attempt: u32,
    ) -> Self {
        Self {
            at,
            key,
            attempt,
            kind: TimerKind::Retry,
        }
    }

    pub(crate) fn ack_deadline(
        at: Instant,
        token: DeliveryToken,
    ) -> Self {
        Self {
            at,
            key: token.key(),
            attempt: token.attempt,
            kind: TimerKind::AckDeadline,
        }
    }
}

/// Min-heap таймеров, упорядоченный по сроку.
pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<Timer>>>,
    wake: Notify,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    /// Добавляет таймер и будит планировщик, если он стал ближайшим.
    pub(crate) fn schedule(
        &self,
        timer: Timer,
    ) {
        let earliest = {
            let mut heap = self.heap.lock();
            let earliest = heap
                .peek()
                .map_or(true, |Reverse(head)| timer.at < head.at);
            heap.push(Reverse(timer));
            earliest
        };
        if earliest {
            self.wake.notify_one();
        }
    }

    /// Извлекает все таймеры со сроком не позже `now`.
    pub(crate) fn pop_due(
        &self,
        now: Instant,
    ) -> Vec<Timer> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(t)| t.at <= now) {
            if let Some(Reverse(timer)) = heap.pop() {
                due.push(timer);
            }
        }
        due
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(t)| t.at)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Оставляет только таймеры, для которых `keep` вернул `true`.
    /// Возвращает число выброшенных.
    pub(crate) fn retain(
        &self,
        mut keep: impl FnMut(&Timer) -> bool,
    ) -> usize {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|Reverse(timer)| keep(timer));
        before - heap.len()
    }

    pub(crate) fn clear(&self) {
        self.heap.lock().clear();
    }
}

/// Сколько лишних таймеров сверх двух на неразрешённую доставку куча
/// терпит до чистки.
const TIMER_PRUNE_SLACK: usize = 256;

/// Цикл планировщика повторов и таймаутов ack.
///
/// Спит до ближайшего таймера (но не дольше `scheduler_tick`), затем
/// передаёт созревшие таймеры диспетчеру. Попутно чистит старые
/// tombstone-ы подтверждённых доставок и таймеры уже разрешённых
/// попыток.
pub(crate) async fn run_scheduler(
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
) {
    let tick = dispatcher.config.scheduler_tick();
    let ttl = dispatcher.config.tombstone_ttl();
    let mut next_purge = Instant::now() + tick;
    debug!(tick_ms = tick.as_millis() as u64, "retry scheduler started");

    loop {
        let now = Instant::now();
        let wake_at = dispatcher
            .timers
            .next_deadline()
            .map_or(now + tick, |at| at.min(now + tick));

        tokio::select! {
            biased;
            _ = wait_stopped(&mut stop) => break,
            _ = dispatcher.timers.wake.notified() => {}
            _ = time::sleep_until(wake_at) => {}
        }

        let now = Instant::now();
        for timer in dispatcher.timers.pop_due(now) {
            dispatcher.fire(timer, now);
        }

        if now >= next_purge {
            if let Some(cutoff) = now.checked_sub(ttl) {
                let purged = dispatcher.tracker.purge_tombstones(cutoff);
                if purged > 0 {
                    trace!(purged, "acked tombstones purged");
                }
            }
            prune_timers(&dispatcher);
            next_purge = now + tick;
        }
    }

    debug!(pending_timers = dispatcher.timers.len(), "retry scheduler stopped");
}

fn prune_timers(dispatcher: &Dispatcher) {
    let limit = dispatcher.tracker.in_flight() * 2 + TIMER_PRUNE_SLACK;
    if dispatcher.timers.len() <= limit {
        return;
    }
    let pruned = dispatcher
        .timers
        .retain(|timer| dispatcher.tracker.expects(timer));
    trace!(pruned, remaining = dispatcher.timers.len(), "settled timers dropped");
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
