use std::time::Duration;

use courier_error::SubscribeError;
use serde::{Deserialize, Serialize};

use super::SettingsError;

/// Параметры одной подписки.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Ёмкость почтового ящика (минимум 1).
    pub mailbox_capacity: usize,
    /// Сколько подписчик может держать доставку без ack/nack.
    pub ack_timeout_ms: u64,
    /// Максимум попыток доставки, включая первую (минимум 1).
    pub max_attempts: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            ack_timeout_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl SubscriptionConfig {
    pub fn new(
        mailbox_capacity: usize,
        ack_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            mailbox_capacity,
            ack_timeout_ms: duration_ms(ack_timeout),
            max_attempts,
        }
    }

    pub fn with_mailbox_capacity(
        mut self,
        capacity: usize,
    ) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_ack_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.ack_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_max_attempts(
        mut self,
        max_attempts: u32,
    ) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SubscribeError> {
        let invalid = |reason: &str| {
            Err(SubscribeError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.mailbox_capacity == 0 {
            return invalid("mailbox_capacity must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.ack_timeout_ms == 0 {
            return invalid("ack_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Параметры брокера.
///
/// Все интервалы хранятся в миллисекундах, чтобы конфиг одинаково
/// читался из файла и из переменных окружения; наружу они отдаются как
/// [`Duration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Кол-во шардов реестра подписок (по-умолчанию: num_cpus * 2).
    pub registry_shards: usize,
    /// Сколько публикация ждёт места в полном ящике одного подписчика.
    pub enqueue_timeout_ms: u64,
    /// Задержка перед второй попыткой; далее удваивается.
    pub retry_base_delay_ms: u64,
    /// Потолок задержки между попытками.
    pub retry_max_delay_ms: u64,
    /// Доля случайного разброса задержки, `0.0..=1.0`.
    pub retry_jitter: f64,
    /// Максимальный интервал сна планировщика повторов.
    pub scheduler_tick_ms: u64,
    /// Сколько хранить подтверждённые записи для идемпотентного ack.
    pub tombstone_ttl_ms: u64,
    /// Grace-период остановки по умолчанию.
    pub shutdown_grace_ms: u64,
    /// Параметры для подписок, созданных без явной конфигурации.
    pub default_subscription: SubscriptionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registry_shards: num_cpus::get() * 2,
            enqueue_timeout_ms: 100,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            retry_jitter: 0.25,
            scheduler_tick_ms: 50,
            tombstone_ttl_ms: 60_000,
            shutdown_grace_ms: 5_000,
            default_subscription: SubscriptionConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_enqueue_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.enqueue_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_retry_delays(
        mut self,
        base: Duration,
        max: Duration,
    ) -> Self {
        self.retry_base_delay_ms = duration_ms(base);
        self.retry_max_delay_ms = duration_ms(max);
        self
    }

    pub fn with_retry_jitter(
        mut self,
        jitter: f64,
    ) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_registry_shards(
        mut self,
        shards: usize,
    ) -> Self {
        self.registry_shards = shards;
        self
    }

    pub fn with_tombstone_ttl(
        mut self,
        ttl: Duration,
    ) -> Self {
        self.tombstone_ttl_ms = duration_ms(ttl);
        self
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(SettingsError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.registry_shards == 0 {
            return invalid("broker.registry_shards", "must be at least 1");
        }
        if self.enqueue_timeout_ms == 0 {
            return invalid("broker.enqueue_timeout_ms", "must be positive");
        }
        if self.retry_base_delay_ms == 0 {
            return invalid("broker.retry_base_delay_ms", "must be positive");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return invalid(
                "broker.retry_max_delay_ms",
                "must not be less than retry_base_delay_ms",
            );
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return invalid("broker.retry_jitter", "must be within 0.0..=1.0");
        }
        if self.scheduler_tick_ms == 0 {
            return invalid("broker.scheduler_tick_ms", "must be positive");
        }
        self.default_subscription
            .validate()
            .map_err(|err| SettingsError::Invalid {
                field: "broker.default_subscription",
                reason: err.to_string(),
            })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
