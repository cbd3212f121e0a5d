use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::domain::parse_event_name;
use crate::error::{ExecutionError, ExecutionResult};
use crate::registry::MonitorContext;

use super::{EventQueueMessage, Executor};

/// Invokes every reaction bound to the event. Reaction failures are
/// logged and counted; they never emit new events.
pub(crate) async fn handle(
    executor: &Executor,
    event: &EventQueueMessage,
    payload: &JsonValue,
    run_cancel: &CancellationToken,
) -> ExecutionResult<()> {
    let Some(definition) = executor.registry.get_by_id(event.event_source_monitor_id) else {
        executor.registry.request_reload();
        return Err(ExecutionError::NotRegistered(format!(
            "monitor id {}",
            event.event_source_monitor_id
        )));
    };

    let Some(event_name) = parse_event_name(&event.event_name) else {
        crate::metrics::incr(crate::metrics::QUEUE_MESSAGES_INVALID);
        tracing::warn!(event_name = %event.event_name, "event message with unknown name");
        return Ok(());
    };
    let Some(callbacks) = definition.reactions.get(&event_name) else {
        // Registration changed since the event was published; nothing to run.
        return Ok(());
    };

    let ctx = MonitorContext::new(
        definition.monitor_id,
        definition.name.clone(),
        executor.store.clone(),
        executor.pools.clone(),
        run_cancel.clone(),
    );

    for callback in callbacks {
        if let Err(err) = callback(ctx.clone(), payload.clone()).await {
            crate::metrics::incr(crate::metrics::REACTION_EXECUTION_ERRORS);
            tracing::warn!(
                monitor = %definition.name,
                event = event_name.as_str(),
                error = %err,
                "reaction callback failed"
            );
        }
    }
    Ok(())
}
