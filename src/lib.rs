/// Settings loading: broker, subscription and logging configuration.
pub mod config;
/// Flexible logging (formatting, filters, sinks).
pub mod logging;
/// Pub/Sub: broker, topic patterns, delivery tracking, retries, dead letters.
pub mod pubsub;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Configuration.
pub use config::{BrokerConfig, Settings, SettingsError, SubscriptionConfig};
/// Error types shared with the `courier-error` crate.
pub use courier_error::{
    BoxedError, CourierResult, ErrorExt, PublishError, RecvError, RequeueError, SettleError,
    StatusCode, SubscribeError, TryRecvError,
};
/// Logging setup.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Pub/Sub API.
pub use pubsub::{
    Broker, DeadLetterEntry, DeadLetterId, DeadLetterReason, DeadLetterStore, Delivery,
    DeliveryState, DeliveryToken, InMemoryDeadLetterStore, Message, MessageId, MetricsSnapshot,
    ShutdownReport, SubscriptionId, SubscriptionInfo, TopicPattern,
};
