/// Receives `(message, fraction)` updates while a backup runs.
pub trait ProgressSink: Send + Sync {
    fn update(&self, message: &str, fraction: f64);
}

/// Receives user-facing notices such as run completion or a busy rejection.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Discards everything. Used by `run-once` and tests that don't observe progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _message: &str, _fraction: f64) {}
}

impl NotificationSink for NullSink {
    fn notify(&self, _title: &str, _message: &str) {}
}
