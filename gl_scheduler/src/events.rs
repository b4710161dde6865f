//! ABOUTME: Lifecycle event emission
//! ABOUTME: Abstract sink the scheduler emits structured events through; failures never propagate

use serde_json::Value;

/// Sink for the scheduler's lifecycle events (`scheduler.started`,
/// `job.completed`, etc. — the full list is in `spec.md` §6). Emission is
/// best-effort: a sink that fails internally should log and swallow the
/// error rather than propagate it, since event delivery must never affect
/// job execution.
pub trait EventSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: Value);
}

/// Default sink: logs every event at debug level via `tracing`. A real
/// application swaps this for one that forwards to its own transport
/// (e.g. CloudEvents) — out of scope for this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event_type: &str, payload: Value) {
        tracing::debug!(event = event_type, payload = %payload, "scheduler event");
    }
}

/// Sink that discards every event. Useful in tests that don't care about
/// the event stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event_type: &str, _payload: Value) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures emitted events for assertions in scheduler tests.
    #[derive(Default)]
    pub struct RecordingEventSink {
        pub events: Mutex<Vec<(String, Value)>>,
    }

    impl EventSink for RecordingEventSink {
        fn emit(&self, event_type: &str, payload: Value) {
            self.events
                .lock()
                .unwrap()
                .push((event_type.to_string(), payload));
        }
    }

    impl RecordingEventSink {
        pub fn event_types(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(t, _)| t.clone())
                .collect()
        }
    }
}
