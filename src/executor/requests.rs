use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ExecutionError, ExecutionResult};
use crate::registry::Registry;
use crate::store::Store;

use super::{Executor, RequestMessage};

/// Dependencies handed to plugin action handlers.
pub struct ActionContext {
    pub store: Store,
    pub registry: Arc<Registry>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ActionContext,
        action: &str,
        params: &JsonValue,
    ) -> anyhow::Result<()>;
}

/// Plugin actions keyed by the action-name prefix (the part before the
/// first underscore). Built-in actions are matched first.
#[derive(Default)]
pub struct ActionRegistry {
    plugins: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_prefix(&mut self, prefix: &str, handler: Arc<dyn ActionHandler>) {
        self.plugins.insert(prefix.trim().to_lowercase(), handler);
    }

    fn get(&self, prefix: &str) -> Option<Arc<dyn ActionHandler>> {
        self.plugins.get(prefix).cloned()
    }
}

pub(crate) async fn handle(executor: &Executor, request: &RequestMessage) -> ExecutionResult<()> {
    let action = request.action.trim().to_lowercase();
    let params = &request.params;
    match action.as_str() {
        "monitor_enable" => set_monitor_enabled(executor, params, true).await,
        "monitor_disable" => set_monitor_enabled(executor, params, false).await,
        "monitor_register" => register_monitor(executor, params).await,
        "alert_acknowledge" => {
            let alert_id = id_param(params, "alert_id")?;
            let at_priority = params
                .get("priority")
                .and_then(|value| value.as_str())
                .and_then(crate::domain::parse_priority);
            apply(
                executor.store.acknowledge_alert(alert_id, at_priority).await,
                "alert",
                alert_id,
            )
        }
        "alert_lock" => {
            let alert_id = id_param(params, "alert_id")?;
            apply(executor.store.lock_alert(alert_id).await, "alert", alert_id)
        }
        "alert_solve" => {
            let alert_id = id_param(params, "alert_id")?;
            apply(executor.store.solve_alert(alert_id).await, "alert", alert_id)
        }
        "issue_drop" => drop_issue(executor, params).await,
        other => {
            let prefix = other.split('_').next().unwrap_or_default();
            let Some(handler) = executor.actions.get(prefix) else {
                crate::metrics::incr(crate::metrics::REQUEST_EXECUTION_ERRORS);
                tracing::warn!(action = %other, "request for unknown action");
                return Ok(());
            };
            let ctx = ActionContext {
                store: executor.store.clone(),
                registry: executor.registry.clone(),
            };
            handler
                .handle(&ctx, other, params)
                .await
                .map_err(ExecutionError::UserCallback)
        }
    }
}

async fn set_monitor_enabled(
    executor: &Executor,
    params: &JsonValue,
    enabled: bool,
) -> ExecutionResult<()> {
    let name = string_param(params, "monitor_name")?;
    let monitor = executor
        .store
        .monitor_by_name(&name)
        .await
        .map_err(ExecutionError::store)?
        .ok_or_else(|| ExecutionError::Validation(format!("unknown monitor {name:?}")))?;
    executor
        .store
        .set_monitor_enabled(monitor.id, enabled)
        .await
        .map_err(ExecutionError::store)?;
    executor.registry.request_reload();
    Ok(())
}

async fn register_monitor(executor: &Executor, params: &JsonValue) -> ExecutionResult<()> {
    let name = string_param(params, "monitor_name")?;
    let Some(module) = executor.registry.catalog().get(&name) else {
        return Err(ExecutionError::Validation(format!(
            "no module available for monitor {name:?}"
        )));
    };
    let document = module.options();
    document
        .validate()
        .map_err(ExecutionError::Validation)?;
    let source = module.source();
    let options_json = serde_json::to_string(&document)
        .map_err(|err| ExecutionError::Validation(err.to_string()))?;
    let code_hash = crate::ids::stable_hex_id("monitor-code", &format!("{source}|{options_json}"));
    executor
        .store
        .register_monitor(&name, &source, &code_hash)
        .await
        .map_err(ExecutionError::store)?;
    executor.registry.request_reload();
    Ok(())
}

async fn drop_issue(executor: &Executor, params: &JsonValue) -> ExecutionResult<()> {
    let issue_id = id_param(params, "issue_id")?;
    let issue = executor
        .store
        .issue_by_id(issue_id)
        .await
        .map_err(ExecutionError::store)?
        .ok_or_else(|| ExecutionError::Validation(format!("unknown issue {issue_id}")))?;
    executor
        .store
        .mark_issue_dropped(issue_id)
        .await
        .map_err(ExecutionError::store)?;

    // The alert sheds the dropped issue on the next recomputation; do it now.
    if let Some(definition) = executor.registry.get_by_id(issue.monitor_id) {
        if let Some(alert_options) = &definition.alert_options {
            executor
                .store
                .recompute_alert(
                    issue.monitor_id,
                    &alert_options.rule,
                    alert_options.dismiss_acknowledge_on_new_issues,
                )
                .await
                .map_err(ExecutionError::store)?;
        }
    }
    Ok(())
}

fn apply(result: anyhow::Result<bool>, entity: &str, id: i64) -> ExecutionResult<()> {
    match result.map_err(ExecutionError::store)? {
        true => Ok(()),
        false => {
            tracing::info!(entity, id, "request had no effect");
            Ok(())
        }
    }
}

fn string_param(params: &JsonValue, key: &str) -> ExecutionResult<String> {
    params
        .get(key)
        .and_then(|value| value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ExecutionError::Validation(format!("missing param {key:?}")))
}

fn id_param(params: &JsonValue, key: &str) -> ExecutionResult<i64> {
    params
        .get(key)
        .and_then(|value| value.as_i64())
        .ok_or_else(|| ExecutionError::Validation(format!("missing param {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_extraction_validates_presence_and_shape() {
        let params = serde_json::json!({ "monitor_name": " disk ", "alert_id": 9 });
        assert_eq!(string_param(&params, "monitor_name").unwrap(), "disk");
        assert_eq!(id_param(&params, "alert_id").unwrap(), 9);

        assert!(matches!(
            string_param(&params, "missing"),
            Err(ExecutionError::Validation(_))
        ));
        assert!(matches!(
            id_param(&params, "monitor_name"),
            Err(ExecutionError::Validation(_))
        ));
    }
}
