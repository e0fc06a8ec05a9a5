use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок брокера.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие и внутренние ошибки
/// - 2xxx: Ошибки запроса (топик, шаблон, конфигурация, доставка)
/// - 4xxx: Перегрузка / backpressure
/// - 6xxx: Жизненный цикл (таймауты, закрытие, остановка)
///
/// # Реализация:
/// - `num_enum::TryFromPrimitive` даёт `TryFrom<u32>` (удобно для внешних
///   протоколов поверх брокера).
/// - опционально: `strum` для `AsRefStr`/`EnumIter` (feature = "strum").
/// - опционально: `serde_repr` для числовой сериализации (feature =
///   "serde_repr").
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unsupported = 1001,
    Unexpected = 1002,
    Internal = 1003,
    InvalidArgs = 1004,
    InvariantViolation = 1005,

    // === 2xxx: Ошибки запроса ===
    NotFound = 2000,
    InvalidTopic = 2001,
    InvalidPattern = 2002,
    InvalidConfig = 2003,
    AlreadyTerminal = 2004,
    SubscriberGone = 2005,

    // === 4xxx: Backpressure ===
    MailboxFull = 4000,
    Empty = 4001,

    // === 6xxx: Жизненный цикл ===
    Timeout = 6000,
    SubscriptionClosed = 6001,
    Cancelled = 6002,
    ShuttingDown = 6003,
    StorageUnavailable = 6004,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// `true`, если вызывающему имеет смысл повторить операцию позже.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::MailboxFull | Self::Empty | Self::StorageUnavailable
        )
    }

    /// Вернёт `true`, если переданный `code` означает успех.
    pub fn is_success(code: u32) -> bool {
        Self::Success as u32 == code
    }

    /// Ошибка вызывающего: некорректный запрос, повтор бессмысленен.
    pub fn is_client_error(&self) -> bool {
        (2000..=2999).contains(&self.code()) || matches!(self, Self::InvalidArgs)
    }

    /// Внутренняя ошибка брокера.
    pub fn is_server_error(&self) -> bool {
        (1000..=1999).contains(&self.code()) && !matches!(self, Self::InvalidArgs)
    }

    /// Требуется ли логировать как критическую ошибку.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Internal | Self::InvariantViolation | Self::StorageUnavailable
        )
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::Empty | Self::Timeout | Self::Cancelled => LogLevel::Trace,
            Self::NotFound | Self::AlreadyTerminal | Self::SubscriptionClosed => LogLevel::Debug,
            Self::InvalidArgs
            | Self::InvalidTopic
            | Self::InvalidPattern
            | Self::InvalidConfig
            | Self::ShuttingDown => LogLevel::Info,
            Self::MailboxFull | Self::SubscriberGone => LogLevel::Warn,
            Self::Internal
            | Self::InvariantViolation
            | Self::StorageUnavailable
            | Self::Unknown
            | Self::Unexpected => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }

    /// HTTP-статус для внешних фронтендов поверх брокера.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Success => 200,
            Self::NotFound => 404,
            Self::AlreadyTerminal => 409,
            Self::SubscriberGone | Self::SubscriptionClosed => 410,
            Self::InvalidArgs | Self::InvalidTopic | Self::InvalidPattern | Self::InvalidConfig => {
                400
            }
            Self::MailboxFull => 429,
            Self::Empty => 204,
            Self::Timeout => 408,
            Self::Unsupported => 501,
            Self::ShuttingDown | Self::StorageUnavailable => 503,
            _ => 500,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
