pub mod broker;
pub mod settings;

use std::any::Any;

pub use broker::{BrokerConfig, SubscriptionConfig};
use courier_error::{ErrorExt, StatusCode};
pub use settings::Settings;
use thiserror::Error;

/// Ошибки загрузки и валидации настроек.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ErrorExt for SettingsError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Load(_) => StatusCode::StorageUnavailable,
            Self::Invalid { .. } => StatusCode::InvalidConfig,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
