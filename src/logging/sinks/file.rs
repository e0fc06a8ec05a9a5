use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::{
    config::{ConsoleConfig, LoggingConfig, Rotation},
    formatter,
};

/// File layer с неблокирующей записью.
///
/// Guard нужно держать живым до конца работы: при его drop-е
/// дописывается буфер.
pub fn layer_with_config<S>(
    config: &LoggingConfig
) -> (Box<dyn LayerTrait<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let dir = &config.log_dir;
    let name = &config.file.file_name;
    let appender = match config.file.rotation {
        Rotation::Hourly => rolling::hourly(dir, name),
        Rotation::Daily => rolling::daily(dir, name),
        Rotation::Never => rolling::never(dir, name),
    };
    let (writer, guard) = non_blocking(appender);

    let opts = ConsoleConfig {
        with_ansi: false,
        ..config.console.clone()
    };
    let layer = formatter::build_formatter(config.file.format, writer, &opts);
    (layer, guard)
}
