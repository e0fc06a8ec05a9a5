use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing_appender::non_blocking::WorkerGuard;

/// Метрики для LoggingHandle.
#[derive(Debug, Default)]
pub struct LoggingMetrics {
    /// Кол-во flush операций
    pub flush_count: AtomicU64,
    /// Флаг активного shutdown
    pub shutdown_in_progress: AtomicBool,
}

/// Статистика логирования.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingStats {
    pub flush_count: u64,
    pub shutdown_in_progress: bool,
    pub file_enabled: bool,
}

/// Handle для управления lifecycle логирования.
///
/// Держит guard неблокирующего file writer-а: пока handle жив, фоновый
/// поток дописывает события в файл.
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    pub metrics: Arc<LoggingMetrics>,
    flush_timeout: Duration,
}

impl LoggingMetrics {
    pub fn record_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::Acquire)
    }

    fn start_shutdown(&self) {
        self.shutdown_in_progress.store(true, Ordering::Release);
    }
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            metrics: Arc::new(LoggingMetrics::default()),
            flush_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_flush_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Отмечает запрос flush-а. Буфер файла дописывается при drop-е guard-а.
    pub fn flush(&self) {
        self.metrics.record_flush();
        tracing::debug!(
            flush_count = self.metrics.flush_count.load(Ordering::Relaxed),
            "Logging flush requested"
        );
    }

    /// Останавливает логирование, дожидаясь записи файлового буфера.
    pub fn shutdown(mut self) {
        self.metrics.start_shutdown();
        tracing::info!(
            timeout_ms = self.flush_timeout.as_millis() as u64,
            "Initiating logging shutdown"
        );

        let start = std::time::Instant::now();
        drop(self.file_guard.take());
        let elapsed = start.elapsed();

        if elapsed > self.flush_timeout {
            eprintln!(
                "WARNING: Logging shutdown took {}ms (timeout: {}ms)",
                elapsed.as_millis(),
                self.flush_timeout.as_millis()
            );
        }
    }

    /// Shutdown с явным таймаутом (для async контекстов).
    pub async fn shutdown_async(
        mut self,
        timeout: Duration,
    ) {
        self.metrics.start_shutdown();

        let file_guard = self.file_guard.take();
        match tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || drop(file_guard)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("Logging shutdown task panicked: {e}"),
            Err(_) => eprintln!(
                "WARNING: Logging shutdown exceeded timeout of {}ms",
                timeout.as_millis()
            ),
        }
    }

    pub fn stats(&self) -> LoggingStats {
        LoggingStats {
            flush_count: self.metrics.flush_count.load(Ordering::Relaxed),
            shutdown_in_progress: self.metrics.is_shutdown_in_progress(),
            file_enabled: self.file_guard.is_some(),
        }
    }
}

impl Drop for LoggingHandle {
    fn drop(&mut self) {
        if self.file_guard.is_some() && !self.metrics.is_shutdown_in_progress() {
            eprintln!(
                "WARNING: LoggingHandle dropped without explicit shutdown(). \
                 Call .shutdown() for graceful cleanup."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет статистику handle без файлового sink-а.
    #[test]
    fn test_stats_without_file() {
        let handle = LoggingHandle::new(None);
        handle.flush();
        handle.flush();

        let stats = handle.stats();
        assert_eq!(stats.flush_count, 2);
        assert!(!stats.file_enabled);
        assert!(!stats.shutdown_in_progress);

        let metrics = Arc::clone(&handle.metrics);
        handle.shutdown();
        assert!(metrics.is_shutdown_in_progress());
    }

    /// Тест проверяет async shutdown с файловым guard-ом.
    #[tokio::test]
    async fn test_shutdown_async_with_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let appender = tracing_appender::rolling::never(tmp.path(), "h.log");
        let (_writer, guard) = tracing_appender::non_blocking(appender);

        let handle = LoggingHandle::new(Some(guard)).with_flush_timeout(Duration::from_secs(1));
        assert!(handle.stats().file_enabled);

        let metrics = Arc::clone(&handle.metrics);
        handle.shutdown_async(Duration::from_secs(1)).await;
        assert!(metrics.is_shutdown_in_progress());
    }
}
