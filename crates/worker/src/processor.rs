//! Demo task body for the worker binary.

use std::time::Duration;

use async_trait::async_trait;
use dendrite_core::{TaskContext, TaskProcessor};
use serde_json::{json, Value};
use tracing::info;

/// Echoes the payload back.
///
/// Two optional payload fields shape the run: `sleep_ms` delays the result,
/// and `fail_attempts` makes the first N attempts fail so retries show up.
pub struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process_task(&self, payload: Value, ctx: TaskContext) -> Result<Value, String> {
        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let fail_attempts = payload
            .get("fail_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if u64::from(ctx.attempt) <= fail_attempts {
            return Err(format!(
                "simulated failure on attempt {} of {fail_attempts}",
                ctx.attempt
            ));
        }
        Ok(json!({ "echo": payload, "task_id": ctx.task_id }))
    }

    fn process_helper_result(&self, task_id: &str, _result: &Value, from: &str) {
        info!(task_id = %task_id, from = %from, "helper finished offloaded task");
    }
}
