// Для возврата используем trait-объект: Box<dyn
// tracing_subscriber::layer::Layer<S> + Send + Sync>
use tracing_subscriber::layer::Layer as LayerTrait;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    registry::LookupSpan,
};

use crate::logging::config::{ConsoleConfig, LogFormat};

/// Строит fmt-layer нужного формата поверх произвольного writer-а.
///
/// Тип формата стирается в boxed trait-объект, чтобы console и file
/// sink-и собирались одинаково.
pub fn build_formatter<S, W>(
    format: LogFormat,
    writer: W,
    opts: &ConsoleConfig,
) -> Box<dyn LayerTrait<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(opts.with_target)
                .with_thread_ids(opts.with_thread_ids)
                .with_line_number(opts.with_line_numbers);
            Box::new(layer)
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(writer)
                .with_ansi(opts.with_ansi)
                .with_target(opts.with_target)
                .with_thread_ids(opts.with_thread_ids)
                .with_line_number(opts.with_line_numbers);
            Box::new(layer)
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(opts.with_ansi)
                .with_target(opts.with_target)
                .with_thread_ids(opts.with_thread_ids)
                .with_line_number(opts.with_line_numbers);
            Box::new(layer)
        }
    }
}
