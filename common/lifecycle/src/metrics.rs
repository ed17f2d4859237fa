pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";
pub(crate) const METRIC_DRAIN_DURATION: &str = "lifecycle_drain_duration_seconds";
pub(crate) const METRIC_CONNECTIONS_TERMINATED: &str = "lifecycle_connections_terminated_total";
pub(crate) const METRIC_BACKGROUND_TASKS: &str = "lifecycle_background_tasks";

pub(crate) fn emit_shutdown_initiated(trigger_signal: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "signal" => trigger_signal.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "clean" => clean.to_string()
    )
    .increment(1);
}

/// `phase` is either `connections` or `background`.
pub(crate) fn emit_drain_duration(phase: &'static str, result: &'static str, duration_secs: f64) {
    metrics::histogram!(
        METRIC_DRAIN_DURATION,
        "phase" => phase,
        "result" => result
    )
    .record(duration_secs);
}

pub(crate) fn emit_connection_terminated() {
    metrics::counter!(METRIC_CONNECTIONS_TERMINATED).increment(1);
}

pub(crate) fn emit_background_tasks(outstanding: usize) {
    metrics::gauge!(METRIC_BACKGROUND_TASKS).set(outstanding as f64);
}
