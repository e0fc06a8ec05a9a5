use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(
                &self,
                f: &mut fmt::Formatter<'_>,
            ) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type!(
    /// Уникальный в пределах брокера идентификатор сообщения.
    MessageId,
    "msg"
);
id_type!(
    /// Идентификатор подписки.
    SubscriptionId,
    "sub"
);
id_type!(
    /// Идентификатор записи в dead-letter хранилище.
    DeadLetterId,
    "dlq"
);

/// Монотонный генератор идентификаторов.
#[derive(Debug)]
pub(crate) struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub(crate) const fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }

    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Сдвигает генератор так, чтобы следующий id был больше `seen`.
    pub(crate) fn observe(
        &self,
        seen: u64,
    ) {
        self.0.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

/// Опубликованное сообщение. После создания не изменяется и разделяется
/// между всеми записями доставки через `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub published_at: SystemTime,
}

impl Message {
    pub fn new(
        id: MessageId,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload: payload.into(),
            published_at: SystemTime::now(),
        }
    }
}

/// Квитанция конкретной попытки доставки: по ней подписчик делает
/// `ack`/`nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken {
    pub message_id: MessageId,
    pub subscription_id: SubscriptionId,
    /// Номер попытки, начиная с 1.
    pub attempt: u32,
}

impl DeliveryToken {
    pub(crate) fn key(&self) -> DeliveryKey {
        DeliveryKey {
            message_id: self.message_id,
            subscription_id: self.subscription_id,
        }
    }
}

/// Ключ записи доставки: пара (сообщение, подписка).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub message_id: MessageId,
    pub subscription_id: SubscriptionId,
}

impl DeliveryKey {
    pub(crate) fn token(
        self,
        attempt: u32,
    ) -> DeliveryToken {
        DeliveryToken {
            message_id: self.message_id,
            subscription_id: self.subscription_id,
            attempt,
        }
    }
}

/// Сообщение, выданное подписчику, вместе с квитанцией попытки.
#[derive(Debug, Clone)]
pub struct Delivery {
    message: Arc<Message>,
    token: DeliveryToken,
}

impl Delivery {
    pub(crate) fn new(
        message: Arc<Message>,
        token: DeliveryToken,
    ) -> Self {
        Self { message, token }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn token(&self) -> DeliveryToken {
        self.token
    }

    pub fn attempt(&self) -> u32 {
        self.token.attempt
    }

    /// `true`, если это повторная попытка доставки.
    pub fn is_redelivery(&self) -> bool {
        self.token.attempt > 1
    }
}
