use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use super::{BrokerConfig, SettingsError};
use crate::logging::LoggingConfig;

/// Полная конфигурация процесса: брокер и логирование.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Загружает настройки: значения по умолчанию, затем файл из
    /// `COURIER_CONFIG` (если задан), затем переменные окружения вида
    /// `COURIER_BROKER__ENQUEUE_TIMEOUT_MS`.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var("COURIER_CONFIG").ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            // Добавляем значения по умолчанию
            .add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let cfg = builder
            // Добавляем переменные окружения с префиксом COURIER_
            .add_source(
                Environment::with_prefix("COURIER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Десериализуем конфигурацию в нашу структуру
        let settings: Settings = cfg.try_deserialize()?;
        settings.broker.validate()?;
        Ok(settings)
    }
}
