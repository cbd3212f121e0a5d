//! Counter names for the engine's failure and lifecycle classification
//! sites. Exposition (Prometheus or otherwise) is wired by the embedding
//! process through the `metrics` facade.

pub const MONITOR_EXECUTION_ERRORS: &str = "sentinela_monitor_execution_errors_total";
pub const EXECUTION_TIMEOUTS: &str = "sentinela_execution_timeouts_total";
pub const REACTION_EXECUTION_ERRORS: &str = "sentinela_reaction_execution_errors_total";
pub const REQUEST_EXECUTION_ERRORS: &str = "sentinela_request_execution_errors_total";
pub const MONITOR_NOT_REGISTERED: &str = "sentinela_monitor_not_registered_total";
pub const STORE_ERRORS: &str = "sentinela_store_errors_total";
pub const VALIDATION_ERRORS: &str = "sentinela_validation_errors_total";
pub const QUEUE_MESSAGES_INVALID: &str = "sentinela_queue_messages_invalid_total";
pub const QUEUE_MESSAGES_PROCESSED: &str = "sentinela_queue_messages_processed_total";
pub const MONITORS_STUCK_RESET: &str = "sentinela_monitors_stuck_reset_total";
pub const EVENTS_PUBLISHED: &str = "sentinela_events_published_total";

pub fn incr(name: &'static str) {
    metrics::counter!(name, 1);
}
