//! Outbound channels the controller publishes on.
//!
//! One broadcast channel per event kind: log lines, state changes and the
//! ready handle. Publishing never blocks; a subscriber that falls behind
//! sees `RecvError::Lagged` and skips ahead.

use tokio::sync::broadcast;
use vos_core::{LogLevel, LogLine, StateChange};

use crate::engine::EngineHandle;

/// Buffered items per channel before slow subscribers start lagging.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Publisher half of the log channel, cloned into every monitor.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: broadcast::Sender<LogLine>,
}

impl LogSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver seeing every line published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    /// Republish one guest console line.
    pub fn console(&self, line: &str) {
        tracing::debug!(target: "vos::console", "{line}");
        let _ = self.tx.send(LogLine::console(line));
    }

    /// Publish a controller diagnostic, mirrored to `tracing` at the matching level.
    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info | LogLevel::Success => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        let _ = self.tx.send(LogLine::controller(level, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(LogLevel::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message);
    }
}

/// All three outbound channels of one controller.
#[derive(Debug, Clone)]
pub struct EventBus {
    logs: LogSink,
    states: broadcast::Sender<StateChange>,
    ready: broadcast::Sender<EngineHandle>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (states, _) = broadcast::channel(capacity);
        let (ready, _) = broadcast::channel(capacity.min(16));
        Self { logs: LogSink::new(capacity), states, ready }
    }

    #[must_use]
    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.logs.subscribe()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.states.subscribe()
    }

    pub fn subscribe_ready(&self) -> broadcast::Receiver<EngineHandle> {
        self.ready.subscribe()
    }

    pub(crate) fn publish_state(&self, change: StateChange) {
        tracing::info!(
            run_id = %change.run_id,
            state = %change.state,
            reason = ?change.reason,
            "VM state changed"
        );
        let _ = self.states.send(change);
    }

    pub(crate) fn publish_ready(&self, engine: EngineHandle) {
        let _ = self.ready.send(engine);
    }
}

#[cfg(test)]
mod tests {
    use vos_core::LogSource;

    use super::*;

    #[tokio::test]
    async fn log_sink_delivers_to_all_subscribers_in_order() {
        let sink = LogSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.console("first");
        sink.warn("second");

        for rx in [&mut a, &mut b] {
            let first = match rx.recv().await {
                Ok(l) => l,
                Err(e) => panic!("recv: {e}"),
            };
            assert_eq!(first.message, "first");
            assert_eq!(first.source, LogSource::Console);

            let second = match rx.recv().await {
                Ok(l) => l,
                Err(e) => panic!("recv: {e}"),
            };
            assert_eq!(second.message, "second");
            assert_eq!(second.level, LogLevel::Warn);
        }
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.logs().info("nobody listening");
    }
}
