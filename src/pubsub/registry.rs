use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use siphasher::sip::SipHasher;
use tokio::time::Instant;

use super::{mailbox::Mailbox, IdGenerator, SubscriptionId, TopicPattern};
use crate::config::SubscriptionConfig;

/// Зарегистрированная подписка: шаблон, параметры и почтовый ящик.
pub(crate) struct SubscriptionEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) pattern: TopicPattern,
    pub(crate) config: SubscriptionConfig,
    pub(crate) mailbox: Mailbox,
    pub(crate) created_at: Instant,
}

/// Публичный снимок состояния подписки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub config: SubscriptionConfig,
    /// Доставок в ящике, ещё не забранных подписчиком.
    pub queued: usize,
    pub age: Duration,
}

impl SubscriptionEntry {
    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            pattern: self.pattern.to_string(),
            config: self.config.clone(),
            queued: self.mailbox.len(),
            age: self.created_at.elapsed(),
        }
    }
}

type Shard = RwLock<HashMap<SubscriptionId, Arc<SubscriptionEntry>>>;

/// Реестр подписок, разбитый на шарды по хешу идентификатора.
///
/// Публикация читает все шарды по очереди и собирает снимок совпавших
/// подписок; блокировки отпускаются до постановки в ящики, поэтому
/// подписка и отписка не ждут медленных доставок.
pub(crate) struct SubscriptionRegistry {
    shards: Vec<Shard>,
    hasher_seed: (u64, u64),
    ids: IdGenerator,
    len: AtomicUsize,
}

impl SubscriptionRegistry {
    pub(crate) fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        let shards = (0..num_shards)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards,
            hasher_seed: (fastrand::u64(..), fastrand::u64(..)),
            ids: IdGenerator::starting_at(1),
            len: AtomicUsize::new(0),
        }
    }

    fn shard_for(
        &self,
        id: SubscriptionId,
    ) -> &Shard {
        let mut hasher = SipHasher::new_with_keys(self.hasher_seed.0, self.hasher_seed.1);
        id.hash(&mut hasher);
        let hash = hasher.finish() as usize;
        let n = self.shards.len();
        let idx = if n.is_power_of_two() {
            hash & (n - 1)
        } else {
            hash % n
        };
        &self.shards[idx]
    }

    /// Регистрирует подписку и возвращает её запись.
    pub(crate) fn register(
        &self,
        pattern: TopicPattern,
        config: SubscriptionConfig,
    ) -> Arc<SubscriptionEntry> {
        let id = SubscriptionId(self.ids.next());
        let entry = Arc::new(SubscriptionEntry {
            id,
            mailbox: Mailbox::new(config.mailbox_capacity),
            pattern,
            config,
            created_at: Instant::now(),
        });

        self.shard_for(id).write().insert(id, Arc::clone(&entry));
        self.len.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Сдвигает нумерацию за уже выданный идентификатор.
    pub(crate) fn observe_id(
        &self,
        id: SubscriptionId,
    ) {
        self.ids.observe(id.get());
    }

    pub(crate) fn remove(
        &self,
        id: SubscriptionId,
    ) -> Option<Arc<SubscriptionEntry>> {
        let removed = self.shard_for(id).write().remove(&id);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub(crate) fn get(
        &self,
        id: SubscriptionId,
    ) -> Option<Arc<SubscriptionEntry>> {
        self.shard_for(id).read().get(&id).cloned()
    }

    /// Снимок подписок, чей шаблон совпадает с топиком, в порядке
    /// регистрации.
    pub(crate) fn matching(
        &self,
        topic: &str,
    ) -> Vec<Arc<SubscriptionEntry>> {
        let mut matched = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            matched.extend(
                guard
                    .values()
                    .filter(|entry| entry.pattern.matches(topic))
                    .cloned(),
            );
        }
        matched.sort_unstable_by_key(|entry| entry.id);
        matched
    }

    /// Удаляет и возвращает все подписки.
    pub(crate) fn drain(&self) -> Vec<Arc<SubscriptionEntry>> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            drained.extend(shard.write().drain().map(|(_, entry)| entry));
        }
        self.len.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
