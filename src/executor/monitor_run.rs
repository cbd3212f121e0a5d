use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::payload::{extract_model_id, normalize_entries};
use crate::domain::{EventName, MonitorTask};
use crate::error::{ExecutionError, ExecutionResult};
use crate::registry::{MonitorContext, MonitorDefinition};
use crate::store::{RunOutcome, RunToken, SolveSource};

use super::{Executor, MonitorWorkMessage};

/// Runs one claimed monitor task end to end: begin-run CAS, callback
/// execution, issue bookkeeping, alert recomputation, end-run.
pub(crate) async fn handle(
    executor: &Executor,
    work: &MonitorWorkMessage,
    token_slot: &Mutex<Option<RunToken>>,
    run_cancel: &CancellationToken,
) -> ExecutionResult<()> {
    let token = executor
        .store
        .begin_run(work.monitor_id, work.task)
        .await
        .map_err(ExecutionError::store)?;
    let Some(token) = token else {
        // Another worker already runs this monitor; the message is stale.
        tracing::debug!(monitor = %work.monitor_name, "run already in flight");
        return Ok(());
    };
    *token_slot.lock().expect("token slot poisoned") = Some(token.clone());

    let Some(definition) = executor.registry.get_by_id(work.monitor_id) else {
        executor.registry.request_reload();
        finish(executor, &token, RunOutcome::NotRegistered).await;
        return Err(ExecutionError::NotRegistered(work.monitor_name.clone()));
    };

    let ctx = MonitorContext::new(
        work.monitor_id,
        work.monitor_name.clone(),
        executor.store.clone(),
        executor.pools.clone(),
        run_cancel.clone(),
    );

    let result = match work.task {
        MonitorTask::Search => run_search(executor, &definition, &ctx).await,
        MonitorTask::Update => run_update(executor, &definition, &ctx).await,
    };

    match result {
        Ok(()) => {
            finish(executor, &token, RunOutcome::Success).await;
            Ok(())
        }
        Err(err) => {
            finish(executor, &token, RunOutcome::Error(err.to_string())).await;
            Err(err)
        }
    }
}

async fn finish(executor: &Executor, token: &RunToken, outcome: RunOutcome) {
    if let Err(err) = executor.store.end_run(token, outcome).await {
        tracing::warn!(
            monitor_id = token.monitor_id,
            error = %err,
            "failed to finalize run"
        );
    }
}

async fn run_search(
    executor: &Executor,
    definition: &MonitorDefinition,
    ctx: &MonitorContext,
) -> ExecutionResult<()> {
    let results = definition
        .module
        .search(ctx)
        .await
        .map_err(ExecutionError::UserCallback)?;

    let mut entries: Vec<(String, JsonValue)> = Vec::new();
    for payload in normalize_entries(results.unwrap_or_default()) {
        let Some(model_id) = extract_model_id(&payload, &definition.issue_options.model_id_key)
        else {
            tracing::debug!(
                monitor = %definition.name,
                key = %definition.issue_options.model_id_key,
                "search entry missing model id; dropped"
            );
            continue;
        };
        entries.push((model_id, JsonValue::Object(payload)));
    }

    let limit = definition.max_issues_creation(executor.config.max_issues_creation);
    if entries.len() > limit {
        entries.truncate(limit);
        executor
            .store
            .emit_monitor_event(
                definition.monitor_id,
                EventName::SearchIssuesLimitReached,
                serde_json::json!({ "limit": limit }),
            )
            .await
            .map_err(ExecutionError::store)?;
    }

    for (model_id, payload) in entries {
        if definition.issue_options.solvable {
            let solved = definition
                .module
                .is_solved(&payload)
                .map_err(ExecutionError::UserCallback)?;
            if solved {
                continue;
            }
        }
        executor
            .store
            .upsert_issue(
                definition.monitor_id,
                &model_id,
                &payload,
                definition.issue_options.unique,
            )
            .await
            .map_err(ExecutionError::store)?;
    }

    recompute(executor, definition).await
}

async fn run_update(
    executor: &Executor,
    definition: &MonitorDefinition,
    ctx: &MonitorContext,
) -> ExecutionResult<()> {
    let active = executor
        .store
        .active_issues(definition.monitor_id)
        .await
        .map_err(ExecutionError::store)?;

    let mut updated: HashMap<i64, JsonValue> = HashMap::new();
    if !active.is_empty() {
        let inputs: Vec<JsonValue> = active.iter().map(|issue| issue.data.0.clone()).collect();
        let returned = definition
            .module
            .update(ctx, inputs)
            .await
            .map_err(ExecutionError::UserCallback)?;

        let by_model: HashMap<&str, i64> = active
            .iter()
            .map(|issue| (issue.model_id.as_str(), issue.id))
            .collect();
        for payload in normalize_entries(returned.unwrap_or_default()) {
            let Some(model_id) =
                extract_model_id(&payload, &definition.issue_options.model_id_key)
            else {
                continue;
            };
            let Some(issue_id) = by_model.get(model_id.as_str()).copied() else {
                tracing::debug!(
                    monitor = %definition.name,
                    model_id = %model_id,
                    "update entry matches no active issue"
                );
                continue;
            };
            let payload = JsonValue::Object(payload);
            executor
                .store
                .update_issue_data(issue_id, &payload)
                .await
                .map_err(ExecutionError::store)?;
            updated.insert(issue_id, payload);
        }
    }

    if definition.issue_options.solvable {
        for issue in &active {
            let data = updated.get(&issue.id).unwrap_or(&issue.data.0);
            let solved = definition
                .module
                .is_solved(data)
                .map_err(ExecutionError::UserCallback)?;
            if solved {
                executor
                    .store
                    .mark_issue_solved(issue.id, SolveSource::Update)
                    .await
                    .map_err(ExecutionError::store)?;
            } else if updated.contains_key(&issue.id) {
                executor
                    .store
                    .record_issue_not_solved(issue.id)
                    .await
                    .map_err(ExecutionError::store)?;
            }
        }
    }

    recompute(executor, definition).await
}

async fn recompute(executor: &Executor, definition: &MonitorDefinition) -> ExecutionResult<()> {
    let Some(alert_options) = &definition.alert_options else {
        return Ok(());
    };
    executor
        .store
        .recompute_alert(
            definition.monitor_id,
            &alert_options.rule,
            alert_options.dismiss_acknowledge_on_new_issues,
        )
        .await
        .map_err(ExecutionError::store)
}
