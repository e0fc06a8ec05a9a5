use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Ошибки настройки логирования.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log level '{0}'")]
    InvalidLevel(String),

    #[error("log file name must not be empty when file logging is enabled")]
    EmptyFileName,

    #[error("failed to prepare log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Формат вывода событий.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Период ротации файла логов.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub format: LogFormat,
    pub file_name: String,
    pub rotation: Rotation,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            file_name: "courier.log".to_string(),
            rotation: Rotation::Daily,
        }
    }
}

/// Конфигурация логирования.
///
/// Переменные окружения `COURIER_LOG_LEVEL`, `COURIER_LOG_FORMAT`,
/// `COURIER_LOG_DIR` и `COURIER_LOG_FILE` перекрывают значения из конфига;
/// `RUST_LOG` целиком заменяет итоговый фильтр.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: PathBuf,
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub console: ConsoleConfig,
    pub file: FileConfig,
    /// Дополнительные директивы фильтра, например `courier::pubsub=trace`.
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            console_enabled: true,
            file_enabled: false,
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("COURIER_LOG_LEVEL") {
            self.level = level.to_ascii_lowercase();
        }
        if let Some(format) = env::var("COURIER_LOG_FORMAT")
            .ok()
            .and_then(|f| LogFormat::parse(&f))
        {
            self.console.format = format;
        }
        if let Ok(dir) = env::var("COURIER_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(enabled) = env::var("COURIER_LOG_FILE") {
            self.file_enabled = matches!(enabled.as_str(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn validate(&self) -> Result<(), LoggingError> {
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(LoggingError::InvalidLevel(self.level.clone()));
        }
        if self.file_enabled && self.file.file_name.trim().is_empty() {
            return Err(LoggingError::EmptyFileName);
        }
        Ok(())
    }

    pub fn ensure_log_dir(&self) -> Result<(), LoggingError> {
        if self.file_enabled {
            fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }

    /// Собирает директиву `EnvFilter`: уровень для крейтов брокера плюс
    /// дополнительные директивы.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = vec![
            format!("courier={}", self.level),
            format!("courier_error={}", self.level),
        ];
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn clear_env() {
        for key in [
            "COURIER_LOG_LEVEL",
            "COURIER_LOG_FORMAT",
            "COURIER_LOG_DIR",
            "COURIER_LOG_FILE",
        ] {
            env::remove_var(key);
        }
    }

    /// Тест проверяет значения по умолчанию.
    #[test]
    fn test_defaults() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.level, "info");
        assert!(cfg.console_enabled);
        assert!(!cfg.file_enabled);
        assert_eq!(cfg.file.format, LogFormat::Json);
        assert!(cfg.validate().is_ok());
    }

    /// Тест проверяет переопределение через переменные окружения.
    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("COURIER_LOG_LEVEL", "DEBUG");
        env::set_var("COURIER_LOG_FORMAT", "json");
        env::set_var("COURIER_LOG_DIR", "/tmp/courier-logs");
        env::set_var("COURIER_LOG_FILE", "true");

        let mut cfg = LoggingConfig::default();
        cfg.apply_env_overrides();
        clear_env();

        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.console.format, LogFormat::Json);
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/courier-logs"));
        assert!(cfg.file_enabled);
    }

    /// Тест проверяет, что неизвестный формат из окружения игнорируется.
    #[test]
    #[serial]
    fn test_env_unknown_format_ignored() {
        clear_env();
        env::set_var("COURIER_LOG_FORMAT", "xml");
        let mut cfg = LoggingConfig::default();
        cfg.apply_env_overrides();
        clear_env();
        assert_eq!(cfg.console.format, LogFormat::Pretty);
    }

    /// Тест проверяет валидацию уровня и имени файла.
    #[test]
    fn test_validate() {
        let cfg = LoggingConfig {
            level: "verbose".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(LoggingError::InvalidLevel(_))));

        let mut cfg = LoggingConfig {
            file_enabled: true,
            ..Default::default()
        };
        cfg.file.file_name = "  ".into();
        assert!(matches!(cfg.validate(), Err(LoggingError::EmptyFileName)));
    }

    /// Тест проверяет сборку директивы фильтра.
    #[test]
    fn test_build_filter_directive() {
        let cfg = LoggingConfig {
            level: "warn".into(),
            directives: vec!["courier::pubsub=trace".into()],
            ..Default::default()
        };
        assert_eq!(
            cfg.build_filter_directive(),
            "courier=warn,courier_error=warn,courier::pubsub=trace"
        );
    }

    /// Тест проверяет создание каталога логов.
    #[test]
    fn test_ensure_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        let cfg = LoggingConfig {
            file_enabled: true,
            log_dir: dir.clone(),
            ..Default::default()
        };
        cfg.ensure_log_dir().unwrap();
        assert!(dir.is_dir());
    }
}
