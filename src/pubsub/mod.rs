//! Подсистема Publish–Subscribe с доставкой at-least-once.
//!
//! - `broker`: публичный фасад [`Broker`] и остановка брокера.
//! - `pattern`: шаблоны топиков с `*` и `**`.
//! - `registry`: шардированный реестр подписок.
//! - `mailbox` (приватный): ограниченные почтовые ящики подписчиков.
//! - `tracker`: автомат состояний доставки.
//! - `retry`: backoff и планировщик таймеров.
//! - `dead_letter`: хранилище недоставленных сообщений.
//! - `dispatcher` (приватный): связывает всё перечисленное.

pub mod broker;
pub mod dead_letter;
mod dispatcher;
mod mailbox;
pub mod message;
pub mod metrics;
pub mod pattern;
pub mod registry;
pub mod retry;
pub mod tracker;

// Публичный экспорт основных типов, чтобы упростить доступ к ним из
// внешнего кода.
pub use broker::{Broker, ShutdownReport};
pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterStore, InMemoryDeadLetterStore};
pub(crate) use message::IdGenerator;
pub use message::{
    DeadLetterId, Delivery, DeliveryKey, DeliveryToken, Message, MessageId, SubscriptionId,
};
pub use metrics::MetricsSnapshot;
pub use pattern::{matches, validate_topic, TopicPattern};
pub use registry::SubscriptionInfo;
pub use retry::Backoff;
pub use tracker::{DeliveryRecord, DeliveryState};
