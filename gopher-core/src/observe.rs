use tracing::info;

/// Sink for diagnostic events, handed to each component instead of relying
/// on a process-wide logger.
pub trait Observer: Send + Sync {
    fn record(&self, event: &str, fields: &[(&str, String)]);
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&self, event: &str, fields: &[(&str, String)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "gopher", event = %event, "{}", fields);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn record(&self, _event: &str, _fields: &[(&str, String)]) {}
}
