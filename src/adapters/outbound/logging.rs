use crate::common::TrackingError;
use crate::domains::logger::{DomainLogger, DynLogger, FileLogger};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

fn forward(logger: &dyn DomainLogger, level: LogLevel, msg: &str) {
    match level {
        LogLevel::Info => logger.info(msg),
        LogLevel::Warn => logger.warn(msg),
        LogLevel::Error => logger.error(msg),
    }
}

/// Routes domain messages into `tracing` under the `route_tracker::domain` target.
struct TracingBridge;

impl DomainLogger for TracingBridge {
    fn info(&self, msg: &str) {
        tracing::info!(target: "route_tracker::domain", "{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "route_tracker::domain", "{}", msg);
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "route_tracker::domain", "{}", msg);
    }
}

pub fn init_tracing_logger() -> DynLogger {
    Arc::new(TracingBridge)
}

/// Installs `fast_log` on the `log` facade and hands back a logger writing through it.
pub fn init_file_logger(path: &str, level: log::LevelFilter) -> Result<DynLogger, TrackingError> {
    FileLogger::init(path, level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize fast_log at {}: {}", path, e))?;
    Ok(Arc::new(FileLogger))
}

struct Discard;

impl DomainLogger for Discard {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}

pub fn init_noop_logger() -> DynLogger {
    Arc::new(Discard)
}

/// Fans every message out to each sink in order.
pub struct MultiLogger {
    sinks: Vec<DynLogger>,
}

impl MultiLogger {
    pub fn new(sinks: Vec<DynLogger>) -> Self {
        Self { sinks }
    }

    fn emit(&self, level: LogLevel, msg: &str) {
        for sink in &self.sinks {
            forward(sink.as_ref(), level, msg);
        }
    }
}

impl DomainLogger for MultiLogger {
    fn info(&self, msg: &str) {
        self.emit(LogLevel::Info, msg);
    }

    fn warn(&self, msg: &str) {
        self.emit(LogLevel::Warn, msg);
    }

    fn error(&self, msg: &str) {
        self.emit(LogLevel::Error, msg);
    }
}

/// File plus tracing output. Falls back to tracing alone when the log file
/// cannot be set up (for example when `fast_log` was already installed).
pub fn init_combined_logger(path: &str, level: log::LevelFilter) -> DynLogger {
    let tracing_logger = init_tracing_logger();
    match init_file_logger(path, level) {
        Ok(file_logger) => Arc::new(MultiLogger::new(vec![file_logger, tracing_logger])),
        Err(e) => {
            tracing::warn!(error = %e, "File logging disabled");
            tracing_logger
        }
    }
}

/// Hands messages to `sink` from a background task. Callers never wait on the
/// sink; when `capacity` messages are queued further ones are dropped.
pub fn init_buffered_logger(sink: DynLogger, capacity: usize) -> DynLogger {
    let (sender, mut receiver) = mpsc::channel::<(LogLevel, String)>(capacity.max(1));

    tokio::spawn(async move {
        while let Some((level, msg)) = receiver.recv().await {
            forward(sink.as_ref(), level, &msg);
        }
    });

    Arc::new(BufferedLogger { sender })
}

struct BufferedLogger {
    sender: mpsc::Sender<(LogLevel, String)>,
}

impl BufferedLogger {
    fn enqueue(&self, level: LogLevel, msg: &str) {
        let _ = self.sender.try_send((level, msg.to_string()));
    }
}

impl DomainLogger for BufferedLogger {
    fn info(&self, msg: &str) {
        self.enqueue(LogLevel::Info, msg);
    }

    fn warn(&self, msg: &str) {
        self.enqueue(LogLevel::Warn, msg);
    }

    fn error(&self, msg: &str) {
        self.enqueue(LogLevel::Error, msg);
    }
}
