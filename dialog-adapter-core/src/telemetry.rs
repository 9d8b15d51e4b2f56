//! RTC debug events and tracing setup
//!
//! The surrounding application can render a live connection log. Those
//! entries reach it only when verbose diagnostics are enabled; every entry is
//! mirrored to `tracing` regardless.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Severity of an RTC debug event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtcLevel {
    /// Plain log line
    Log,
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Subsystem that produced an RTC debug event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtcTag {
    /// Signaling channel
    Signaling,
    /// Media transports, producers and consumers
    #[serde(rename = "RTC")]
    Rtc,
    /// Adapter-level logic
    Adapter,
    /// Alternate delivery backend
    Backend,
}

impl fmt::Display for RtcTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signaling => "Signaling",
            Self::Rtc => "RTC",
            Self::Adapter => "Adapter",
            Self::Backend => "Backend",
        })
    }
}

/// Structured debug event delivered to the telemetry sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcEvent {
    /// Severity
    pub level: RtcLevel,
    /// Subsystem
    pub tag: RtcTag,
    /// Local wall-clock time, `HH:MM:SS`
    pub time: String,
    /// Message
    pub msg: String,
}

/// Receiver of RTC debug events (typically a debug panel)
pub trait TelemetrySink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: RtcEvent);
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: RtcEvent) {}
}

/// Gate in front of a telemetry sink
#[derive(Clone)]
pub struct RtcEmitter {
    sink: Arc<dyn TelemetrySink>,
    verbose: bool,
}

impl RtcEmitter {
    /// Create an emitter; events reach `sink` only when `verbose`
    pub fn new(sink: Arc<dyn TelemetrySink>, verbose: bool) -> Self {
        Self { sink, verbose }
    }

    /// Record an event. It is always mirrored to `tracing`; the sink only
    /// sees it when verbose diagnostics are on.
    pub fn emit(&self, level: RtcLevel, tag: RtcTag, msg: impl FnOnce() -> String) {
        let traced = match level {
            RtcLevel::Error => tracing::enabled!(tracing::Level::ERROR),
            RtcLevel::Warn => tracing::enabled!(tracing::Level::WARN),
            RtcLevel::Info | RtcLevel::Log => tracing::enabled!(tracing::Level::DEBUG),
        };
        if !traced && !self.verbose {
            return;
        }
        let msg = msg();
        match level {
            RtcLevel::Error => tracing::error!(tag = %tag, "{}", msg),
            RtcLevel::Warn => tracing::warn!(tag = %tag, "{}", msg),
            RtcLevel::Info | RtcLevel::Log => tracing::debug!(tag = %tag, "{}", msg),
        }
        if !self.verbose {
            return;
        }
        self.sink.emit(RtcEvent {
            level,
            tag,
            time: chrono::Local::now().format("%H:%M:%S").to_string(),
            msg,
        });
    }
}

/// Filter used by [`init_tracing`] when none is given
pub const DEFAULT_TRACING_FILTER: &str = "dialog_adapter_core=info";

/// Install a global fmt subscriber filtered by `filter`
/// (e.g. `"dialog_adapter_core=debug"`), or by [`DEFAULT_TRACING_FILTER`]
/// when the filter is empty.
///
/// # Errors
///
/// Returns error if the filter does not parse or a global subscriber is
/// already installed
pub fn init_tracing(filter: &str) -> anyhow::Result<()> {
    let filter = if filter.trim().is_empty() {
        DEFAULT_TRACING_FILTER
    } else {
        filter
    };
    let filter = tracing_subscriber::EnvFilter::try_new(filter)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RtcEvent>>);

    impl TelemetrySink for Collect {
        fn emit(&self, event: RtcEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_quiet_emitter_never_reaches_sink() {
        let sink = Arc::new(Collect::default());
        let emitter = RtcEmitter::new(sink.clone(), false);
        emitter.emit(RtcLevel::Error, RtcTag::Rtc, || "boom".to_string());
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_quiet_emitter_skips_message_below_trace_level() {
        let sink = Arc::new(Collect::default());
        let emitter = RtcEmitter::new(sink.clone(), false);
        let built = std::cell::Cell::new(false);
        emitter.emit(RtcLevel::Log, RtcTag::Rtc, || {
            built.set(true);
            "consumer stats".to_string()
        });
        assert!(!built.get());
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_verbose_emitter_stamps_time() {
        let sink = Arc::new(Collect::default());
        let emitter = RtcEmitter::new(sink.clone(), true);
        emitter.emit(RtcLevel::Info, RtcTag::Signaling, || "Open".to_string());

        let events = sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, RtcTag::Signaling);
        assert_eq!(events[0].msg, "Open");
        assert_eq!(events[0].time.len(), 8);
        assert_eq!(events[0].time.matches(':').count(), 2);
    }

    #[test]
    fn test_init_tracing_rejects_second_install() {
        let first = init_tracing("");
        let second = init_tracing("dialog_adapter_core=debug");
        // Another test binary may already own the global subscriber
        assert!(first.is_err() || second.is_err());
    }
}
