//! Log shipping.
//!
//! [`CloudLogLayer`] is a `tracing` layer that forwards application events at
//! or above the endpoint's log level to `@logs/{id}`. The level can be changed
//! remotely and survives restarts through the store's `logLevel` property.
//! Events from this runtime and its transport stack are never forwarded.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use edgesync_core::clock;
use edgesync_proto::LogRecordMessage;
use parking_lot::RwLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const SKIPPED_TARGETS: [&str; 5] = [
    "edgesync_core",
    "edgesync_proto",
    "edgesync_endpoint",
    "rumqttc",
    "rusqlite",
];

/// Log level names accepted on `@logsLevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Nothing is shipped
    Off,
    /// Only errors (there is no separate fatal level)
    Fatal,
    /// Errors
    Error,
    /// Warnings and above
    Warn,
    /// Info and above
    Info,
    /// Debug and above
    Debug,
    /// Everything
    Trace,
    /// Everything
    All,
}

impl LogLevel {
    const LEVELS: [LogLevel; 8] = [
        LogLevel::Off,
        LogLevel::Fatal,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
        LogLevel::All,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
            Self::All => "ALL",
        }
    }

    /// Whether events of `level` pass this threshold.
    #[must_use]
    pub fn enables(self, level: &Level) -> bool {
        let rank = match *level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warn,
            Level::INFO => Self::Info,
            Level::DEBUG => Self::Debug,
            Level::TRACE => Self::Trace,
        };
        let threshold = match self {
            Self::Off => return false,
            Self::Fatal => Self::Error,
            other => other,
        };
        rank <= threshold
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        Self::LEVELS
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Self::Warn)
    }
}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::LEVELS
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ParseLogLevelError(name.to_string()))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown log level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLogLevelError(String);

/// Receiver of shipped log records.
pub trait LogSink: Send + Sync {
    /// Ship one record.
    fn ship(&self, record: LogRecordMessage);
}

struct HandleInner {
    level: AtomicU8,
    sink: RwLock<Option<Weak<dyn LogSink>>>,
}

/// Shared control of a [`CloudLogLayer`]: its level and its destination.
#[derive(Clone)]
pub struct CloudLogHandle {
    inner: Arc<HandleInner>,
}

impl CloudLogHandle {
    /// Current level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    /// Change the level.
    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level.to_u8(), Ordering::Relaxed);
    }

    pub(crate) fn attach(&self, sink: Weak<dyn LogSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    pub(crate) fn detach(&self) {
        *self.inner.sink.write() = None;
    }

    fn sink(&self) -> Option<Arc<dyn LogSink>> {
        self.inner.sink.read().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for CloudLogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudLogHandle")
            .field("level", &self.level())
            .field("attached", &self.sink().is_some())
            .finish()
    }
}

/// `tracing` layer shipping events to the broker.
pub struct CloudLogLayer {
    handle: CloudLogHandle,
}

impl CloudLogLayer {
    /// Create a layer shipping warnings and above, and its handle.
    #[must_use]
    pub fn new() -> (Self, CloudLogHandle) {
        Self::with_level(LogLevel::Warn)
    }

    /// Create a layer with an initial level, and its handle.
    #[must_use]
    pub fn with_level(level: LogLevel) -> (Self, CloudLogHandle) {
        let handle = CloudLogHandle {
            inner: Arc::new(HandleInner {
                level: AtomicU8::new(level.to_u8()),
                sink: RwLock::new(None),
            }),
        };
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<S> Layer<S> for CloudLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if SKIPPED_TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
        {
            return;
        }
        if !self.handle.level().enables(metadata.level()) {
            return;
        }
        let Some(sink) = self.handle.sink() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let log_source = match (metadata.file(), metadata.line()) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file.to_string(),
            _ => metadata.module_path().unwrap_or_default().to_string(),
        };

        sink.ship(LogRecordMessage {
            level: metadata.level().to_string(),
            timestamp: clock::to_seconds(clock::wall_ms()),
            message: visitor.finish(),
            logger_name: metadata.target().to_string(),
            log_source,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct Collector(Mutex<Vec<LogRecordMessage>>);

    impl LogSink for Collector {
        fn ship(&self, record: LogRecordMessage) {
            self.0.lock().push(record);
        }
    }

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" FATAL ".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn thresholds() {
        assert!(LogLevel::Warn.enables(&Level::ERROR));
        assert!(!LogLevel::Warn.enables(&Level::INFO));
        assert!(LogLevel::Fatal.enables(&Level::ERROR));
        assert!(!LogLevel::Off.enables(&Level::ERROR));
        assert!(LogLevel::All.enables(&Level::TRACE));
    }

    #[test]
    fn layer_ships_application_events_only() {
        let (layer, handle) = CloudLogLayer::with_level(LogLevel::Info);
        let collector = Arc::new(Collector::default());
        let sink: Arc<dyn LogSink> = collector.clone();
        handle.attach(Arc::downgrade(&sink));

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app::sensor", reading = 21, "Sampled");
            tracing::debug!(target: "app::sensor", "Too verbose");
            tracing::error!(target: "edgesync_endpoint::delivery", "Internal");
            tracing::warn!(target: "rumqttc::state", "Transport");
        });

        let records = collector.0.lock().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "INFO");
        assert_eq!(records[0].logger_name, "app::sensor");
        assert_eq!(records[0].message, "Sampled reading=21");

        handle.set_level(LogLevel::Off);
        handle.detach();
        assert_eq!(handle.level(), LogLevel::Off);
    }
}
