//! JSON-lines seed file: one task per line.
//!
//! ```text
//! {"payload": {"url": "https://example.org"}, "priority": "high"}
//! {"payload": {"sleep_ms": 200, "fail_attempts": 1}, "task_id": "flaky-1"}
//! ```
//!
//! Every key except `payload` is a `TaskOptions` field. Blank lines and
//! lines starting with `#` are skipped.

use std::path::Path;

use anyhow::Context;
use dendrite_core::TaskOptions;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct SeedTask {
    pub payload: Value,
    #[serde(flatten)]
    pub options: TaskOptions,
}

pub fn load(path: &Path) -> anyhow::Result<Vec<SeedTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    parse(&content)
}

fn parse(content: &str) -> anyhow::Result<Vec<SeedTask>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("seed line {}", i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_core::TaskPriority;

    #[test]
    fn parses_payload_and_options() {
        let tasks = parse(
            r#"
# warm-up batch
{"payload": {"n": 1}, "priority": "high", "task_id": "a"}

{"payload": 2, "callback": "orchestrator", "max_attempts": 5}
"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].payload["n"], 1);
        assert_eq!(tasks[0].options.priority, TaskPriority::High);
        assert_eq!(tasks[0].options.task_id.as_deref(), Some("a"));
        assert_eq!(tasks[1].options.priority, TaskPriority::Normal);
        assert_eq!(tasks[1].options.callback.as_deref(), Some("orchestrator"));
        assert_eq!(tasks[1].options.max_attempts, Some(5));
    }

    #[test]
    fn reports_the_bad_line() {
        let err = parse("{\"payload\": 1}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("seed line 2"));
    }

    #[test]
    fn missing_payload_is_an_error() {
        assert!(parse("{\"priority\": \"low\"}").is_err());
    }
}
