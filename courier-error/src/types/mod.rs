pub mod broker;

// Публичный экспорт всех типов ошибок, чтобы упростить доступ к ним из
// внешнего кода.
pub use broker::*;

use crate::{ErrorExt, StatusCode};

/// Универсальная ошибка с кодом и сообщением.
///
/// Подходит для внешних коллабораторов (хранилища, экспортёры), у которых
/// нет собственного типа ошибки.
#[derive(Debug, Clone)]
pub struct GenericError {
    code: StatusCode,
    message: String,
}

impl GenericError {
    pub fn new(
        code: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GenericError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GenericError {}

impl ErrorExt for GenericError {
    fn status_code(&self) -> StatusCode {
        self.code
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Конвертация из std::io::Error (файловые хранилища dead-letter записей).
impl From<std::io::Error> for crate::BoxedError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => StatusCode::NotFound,
            std::io::ErrorKind::TimedOut => StatusCode::Timeout,
            _ => StatusCode::StorageUnavailable,
        };

        crate::BoxedError::new(GenericError::new(code, err.to_string()))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    /// Тест проверяет базовое поведение GenericError: статус код и вывод в
    /// строку.
    #[test]
    fn test_generic_error_basic() {
        let err = GenericError::new(StatusCode::StorageUnavailable, "disk detached");
        assert_eq!(err.status_code(), StatusCode::StorageUnavailable);
        assert_eq!(err.to_string(), "disk detached");
    }

    /// Тест проверяет маппинг std::io::ErrorKind -> StatusCode.
    #[test]
    fn test_io_error_kind_mapping() {
        let cases = [
            (io::ErrorKind::NotFound, StatusCode::NotFound),
            (io::ErrorKind::TimedOut, StatusCode::Timeout),
            (io::ErrorKind::PermissionDenied, StatusCode::StorageUnavailable),
        ];

        for (kind, expected) in cases {
            let boxed: crate::BoxedError = io::Error::new(kind, "io").into();
            assert_eq!(boxed.status_code(), expected, "kind={kind:?}");
            assert!(boxed.to_string().contains("io"));
        }
    }
}
