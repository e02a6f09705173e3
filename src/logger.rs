//! Log sink registry and tracing bridge.
//!
//! The crate logs through `tracing` internally. Hosts that want the output
//! (including C hosts through the FFI layer) register per-level sinks here;
//! a `tracing-subscriber` layer forwards each event's rendered message to
//! the sink matching its level. The three legacy levels without a `tracing`
//! counterpart (`status`, `always`, `fatal`) are emitted through explicit
//! calls from the lifecycle code.

use std::fmt::Write as _;
use std::sync::RwLock;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Sink levels, matching the embedding API's eight registration calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Status = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
    Always = 6,
    Trace = 7,
}

/// A host-provided log sink. Receives one UTF-8 line per call.
pub type LogSink = Box<dyn Fn(&str) + Send + Sync>;

static SINKS: RwLock<[Option<LogSink>; 8]> =
    RwLock::new([None, None, None, None, None, None, None, None]);

/// Install (or with `None`, remove) the sink for one level.
pub fn register_sink(level: LogLevel, sink: Option<LogSink>) {
    if let Ok(mut sinks) = SINKS.write() {
        sinks[level as usize] = sink;
    }
}

pub(crate) fn emit(level: LogLevel, message: &str) {
    if let Ok(sinks) = SINKS.read() {
        if let Some(sink) = &sinks[level as usize] {
            sink(message);
        }
    }
}

/// Status-level output: lifecycle transitions the host always wants to see.
pub(crate) fn status(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!(target: "gatt_server::status", "{}", message);
    emit(LogLevel::Status, message);
}

/// Unrecoverable failures, reported just before shutdown is triggered.
pub(crate) fn fatal(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::error!(target: "gatt_server::fatal", "{}", message);
    emit(LogLevel::Fatal, message);
}

/// Unconditional output (banners and the like).
#[allow(dead_code)]
pub(crate) fn always(message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!(target: "gatt_server::always", "{}", message);
    emit(LogLevel::Always, message);
}

/// Layer that mirrors tracing events into the registered sinks.
struct SinkLayer;

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // status/fatal/always reach their sinks via the explicit calls above.
        let target = event.metadata().target();
        if target == "gatt_server::status"
            || target == "gatt_server::fatal"
            || target == "gatt_server::always"
        {
            return;
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        };
        emit(level, &visitor.message);
    }
}

/// Install the sink layer as the process subscriber. Safe to call more than
/// once; only the first call wins, and a host that has already installed its
/// own subscriber keeps it.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry().with(SinkLayer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sink_receives_emitted_lines() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        register_sink(
            LogLevel::Status,
            Some(Box::new(move |line: &str| {
                assert!(line.contains("state")) ;
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        emit(LogLevel::Status, "state changed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        register_sink(LogLevel::Status, None);
        emit(LogLevel::Status, "state changed again");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_levels_are_silent() {
        // Must not panic or block with no sink present.
        emit(LogLevel::Trace, "nobody listening");
        emit(LogLevel::Fatal, "nobody listening");
    }
}
