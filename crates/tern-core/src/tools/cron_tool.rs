//! Cron tool: lets the model manage scheduled jobs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::cron::CronService;
use crate::tools::registry::{Tool, ToolError};

/// Tool exposing add/list/remove on the [`CronService`].
pub struct CronTool {
    service: Arc<CronService>,
    context: Mutex<Option<(String, String)>>,
}

impl CronTool {
    /// Create the tool over a service.
    pub fn new(service: Arc<CronService>) -> Self {
        Self {
            service,
            context: Mutex::new(None),
        }
    }

    /// Point new jobs at the current turn's channel and chat.
    pub fn set_context(&self, channel: &str, chat_id: &str) {
        *self.context.lock().unwrap() = Some((channel.to_string(), chat_id.to_string()));
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Manage scheduled jobs. Actions: 'add' (name, schedule as a cron expression, \
         message), 'list', 'remove' (job_id). Scheduled messages are processed by the \
         agent and the response is delivered to this chat."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Operation to perform"
                },
                "name": {"type": "string", "description": "Job label (for add)"},
                "schedule": {
                    "type": "string",
                    "description": "Cron expression, e.g. '0 8 * * *' for 08:00 daily (for add)"
                },
                "message": {"type": "string", "description": "Prompt to run on schedule (for add)"},
                "job_id": {"type": "string", "description": "Job id (for remove)"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: action".into()))?;

        match action {
            "add" => {
                let name = args
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("scheduled job");
                let schedule = args
                    .get("schedule")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidArgs("add requires 'schedule'".into()))?;
                let message = args
                    .get("message")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidArgs("add requires 'message'".into()))?;
                let (channel, chat_id) = self
                    .context
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| ToolError::ExecutionFailed("no current conversation".into()))?;

                let id = self
                    .service
                    .add_job(name, schedule, message, &channel, &chat_id)
                    .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
                Ok(format!("Scheduled job '{name}' ({id}) with schedule '{schedule}'"))
            }
            "list" => {
                let jobs = self.service.list_jobs();
                if jobs.is_empty() {
                    return Ok("No scheduled jobs.".into());
                }
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| {
                        format!(
                            "- {} ({}): '{}' schedule={} next={}",
                            j.name,
                            j.id,
                            j.message,
                            j.schedule,
                            j.next_run
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".into()),
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            "remove" => {
                let job_id = args
                    .get("job_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidArgs("remove requires 'job_id'".into()))?;
                if self.service.remove_job(job_id) {
                    Ok(format!("Removed job {job_id}"))
                } else {
                    Err(ToolError::NotFound(format!("no job with id {job_id}")))
                }
            }
            other => Err(ToolError::InvalidArgs(format!("unknown action '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tool() -> (CronTool, TempDir) {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(CronService::new(dir.path().join("jobs.json")));
        let tool = CronTool::new(service);
        tool.set_context("cli", "direct");
        (tool, dir)
    }

    #[tokio::test]
    async fn add_list_remove_roundtrip() {
        let (tool, _dir) = tool();
        let added = tool
            .execute(json!({
                "action": "add",
                "name": "brief",
                "schedule": "0 8 * * *",
                "message": "morning brief please"
            }))
            .await
            .unwrap();
        assert!(added.contains("Scheduled job 'brief'"));

        let listed = tool.execute(json!({"action": "list"})).await.unwrap();
        assert!(listed.contains("morning brief please"));

        let id = listed
            .split('(')
            .nth(1)
            .unwrap()
            .split(')')
            .next()
            .unwrap()
            .to_string();
        let removed = tool
            .execute(json!({"action": "remove", "job_id": id}))
            .await
            .unwrap();
        assert!(removed.starts_with("Removed job"));
        assert_eq!(
            tool.execute(json!({"action": "list"})).await.unwrap(),
            "No scheduled jobs."
        );
    }

    #[tokio::test]
    async fn bad_schedule_is_invalid_args() {
        let (tool, _dir) = tool();
        let err = tool
            .execute(json!({"action": "add", "schedule": "whenever", "message": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn unknown_action_rejected() {
        let (tool, _dir) = tool();
        let err = tool
            .execute(json!({"action": "pause"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
