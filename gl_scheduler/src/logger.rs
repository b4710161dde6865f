//! ABOUTME: Injectable logger interface
//! ABOUTME: Default implementation routes through the tracing crate like the rest of the workspace

/// Four-severity logger interface the scheduler is built against. The
/// surrounding application supplies an implementation; `TracingLogger` is
/// the default used when none is provided, matching how every other
/// workspace crate logs via `tracing`.
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str, kv: &[(&str, &str)]);
    fn info(&self, msg: &str, kv: &[(&str, &str)]);
    fn warn(&self, msg: &str, kv: &[(&str, &str)]);
    fn error(&self, msg: &str, kv: &[(&str, &str)]);
}

fn format_kv(kv: &[(&str, &str)]) -> String {
    kv.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default `Logger` impl that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str, kv: &[(&str, &str)]) {
        tracing::debug!(fields = %format_kv(kv), "{msg}");
    }

    fn info(&self, msg: &str, kv: &[(&str, &str)]) {
        tracing::info!(fields = %format_kv(kv), "{msg}");
    }

    fn warn(&self, msg: &str, kv: &[(&str, &str)]) {
        tracing::warn!(fields = %format_kv(kv), "{msg}");
    }

    fn error(&self, msg: &str, kv: &[(&str, &str)]) {
        tracing::error!(fields = %format_kv(kv), "{msg}");
    }
}
