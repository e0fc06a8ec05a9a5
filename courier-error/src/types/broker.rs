use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки публикации сообщения.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Топик не прошёл валидацию (пустой, пустой сегмент, wildcard).
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Брокер останавливается и больше не принимает публикации.
    #[error("broker is shutting down")]
    ShuttingDown,
}

/// Ошибки создания подписки.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid subscription config: {reason}")]
    InvalidConfig { reason: String },

    #[error("broker is shutting down")]
    ShuttingDown,
}

/// Ошибки блокирующего получения сообщения из почтового ящика.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// Дедлайн истёк раньше, чем пришло сообщение.
    #[error("receive deadline elapsed")]
    Timeout,

    /// Подписка удалена (или неизвестна), почтовый ящик закрыт.
    #[error("subscription is closed")]
    SubscriptionClosed,

    /// Ожидание прервано сигналом отмены.
    #[error("receive was cancelled")]
    Cancelled,
}

/// Ошибки неблокирующего получения сообщения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("no messages available")]
    Empty,

    #[error("subscription is closed")]
    SubscriptionClosed,
}

/// Ошибки подтверждения (`ack`/`nack`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettleError {
    /// Запись доставки неизвестна или уже в терминальном состоянии.
    #[error("delivery of message {message_id} to subscription {subscription_id} is already terminal")]
    AlreadyTerminal {
        message_id: u64,
        subscription_id: u64,
    },
}

/// Ошибки повторной постановки dead-letter записи.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequeueError {
    #[error("dead letter entry {entry_id} not found")]
    NotFound { entry_id: u64 },

    #[error("subscription {subscription_id} no longer exists")]
    SubscriberGone { subscription_id: u64 },

    #[error("broker is shutting down")]
    ShuttingDown,
}

impl ErrorExt for PublishError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidTopic { .. } => StatusCode::InvalidTopic,
            Self::ShuttingDown => StatusCode::ShuttingDown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "broker_publish".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Self::InvalidTopic { topic, .. } = self {
            tags.push(("topic", topic.clone()));
        }
        tags
    }
}

impl ErrorExt for SubscribeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPattern { .. } => StatusCode::InvalidPattern,
            Self::InvalidConfig { .. } => StatusCode::InvalidConfig,
            Self::ShuttingDown => StatusCode::ShuttingDown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "broker_subscribe".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Self::InvalidPattern { pattern, .. } = self {
            tags.push(("pattern", pattern.clone()));
        }
        tags
    }
}

impl ErrorExt for RecvError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout => StatusCode::Timeout,
            Self::SubscriptionClosed => StatusCode::SubscriptionClosed,
            Self::Cancelled => StatusCode::Cancelled,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ErrorExt for TryRecvError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Empty => StatusCode::Empty,
            Self::SubscriptionClosed => StatusCode::SubscriptionClosed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ErrorExt for SettleError {
    fn status_code(&self) -> StatusCode {
        StatusCode::AlreadyTerminal
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let Self::AlreadyTerminal {
            message_id,
            subscription_id,
        } = self;
        vec![
            ("error_type", "broker_settle".to_string()),
            ("status_code", self.status_code().to_string()),
            ("message_id", message_id.to_string()),
            ("subscription_id", subscription_id.to_string()),
        ]
    }
}

impl ErrorExt for RequeueError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::SubscriberGone { .. } => StatusCode::SubscriberGone,
            Self::ShuttingDown => StatusCode::ShuttingDown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error() {
        let err = PublishError::InvalidTopic {
            topic: "orders..created".to_string(),
            reason: "empty segment".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::InvalidTopic);
        assert!(err.to_string().contains("orders..created"));
        assert!(err
            .metrics_tags()
            .iter()
            .any(|(k, v)| *k == "topic" && v == "orders..created"));
    }

    #[test]
    fn test_subscribe_error() {
        let err = SubscribeError::InvalidPattern {
            pattern: "a.**.b".to_string(),
            reason: "`**` must be last".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::InvalidPattern);
        assert!(err.status_code().is_client_error());
        assert_eq!(err.client_message(), err.to_string());
    }

    #[test]
    fn test_settle_error() {
        let err = SettleError::AlreadyTerminal {
            message_id: 42,
            subscription_id: 7,
        };
        assert_eq!(err.status_code(), StatusCode::AlreadyTerminal);
        let tags = err.metrics_tags();
        assert!(tags.iter().any(|(k, v)| *k == "message_id" && v == "42"));
        assert!(tags.iter().any(|(k, v)| *k == "subscription_id" && v == "7"));
    }

    #[test]
    fn test_recv_errors() {
        assert_eq!(RecvError::Timeout.status_code(), StatusCode::Timeout);
        assert!(RecvError::Timeout.status_code().is_retryable());
        assert_eq!(
            RecvError::SubscriptionClosed.status_code(),
            TryRecvError::SubscriptionClosed.status_code()
        );
        assert_eq!(TryRecvError::Empty.status_code(), StatusCode::Empty);
    }

    #[test]
    fn test_requeue_error() {
        let err = RequeueError::SubscriberGone { subscription_id: 3 };
        assert_eq!(err.status_code(), StatusCode::SubscriberGone);
        assert_eq!(
            RequeueError::NotFound { entry_id: 1 }.status_code(),
            StatusCode::NotFound
        );
    }
}
