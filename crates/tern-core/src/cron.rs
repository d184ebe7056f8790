//! Cron scheduling service.
//!
//! Jobs are standard cron expressions (5-field expressions get a
//! seconds column prepended) that fire [`InboundMessage`]s into the bus
//! when due, so scheduled prompts flow through the same agent loop as
//! user messages. Jobs persist to a JSON file rewritten atomically.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tern_types::event::InboundMessage;
use tern_types::{Result, TernError};

use crate::bus::MessageBus;

/// How often the scheduler wakes to check for due jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(20);

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    /// Job id (`job-<uuid>`).
    pub id: String,
    /// Human label.
    pub name: String,
    /// Cron expression (normalized to include seconds).
    pub schedule: String,
    /// Prompt delivered to the agent when the job fires.
    pub message: String,
    /// Channel the response should reach.
    pub channel: String,
    /// Chat the response should reach.
    pub chat_id: String,
    /// Disabled jobs are kept but never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Next time the job is due.
    pub next_run: Option<DateTime<Utc>>,
    /// Last time the job fired.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// Normalize a cron expression: 5-field expressions (minute-first) get
/// a `0` seconds column prepended for the parser.
fn normalize_expression(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_expression(expr)).map_err(|e| TernError::ConfigInvalid {
        reason: format!("invalid cron expression '{expr}': {e}"),
    })
}

fn compute_next_run(expr: &str, after: &DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.after(after).next())
}

/// Scheduler firing job prompts into the message bus.
pub struct CronService {
    storage_path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl CronService {
    /// Create a service, loading persisted jobs from `storage_path`.
    pub fn new(storage_path: PathBuf) -> Self {
        let jobs = match std::fs::read_to_string(&storage_path) {
            Ok(content) => match serde_json::from_str::<Vec<CronJob>>(&content) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "failed to parse cron jobs file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            storage_path,
            jobs: Mutex::new(jobs),
        }
    }

    /// Add a job. Returns its id.
    pub fn add_job(
        &self,
        name: &str,
        schedule: &str,
        message: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let next_run = compute_next_run(schedule, &now)?;
        let id = format!("job-{}", uuid::Uuid::new_v4());
        let job = CronJob {
            id: id.clone(),
            name: name.to_string(),
            schedule: normalize_expression(schedule),
            message: message.to_string(),
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            enabled: true,
            created_at: now,
            next_run,
            last_run: None,
        };
        self.jobs.lock().unwrap().push(job);
        self.persist();
        info!(job = %id, name, schedule, "cron job added");
        Ok(id)
    }

    /// All jobs.
    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Remove a job by id. Returns whether it existed.
    pub fn remove_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        drop(jobs);
        if removed {
            self.persist();
            info!(job = %id, "cron job removed");
        }
        removed
    }

    /// Jobs due at `now`; advances their `next_run`/`last_run`.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        let mut due = Vec::new();
        let mut changed = false;
        {
            let mut jobs = self.jobs.lock().unwrap();
            for job in jobs.iter_mut() {
                if !job.enabled {
                    continue;
                }
                let Some(next) = job.next_run else { continue };
                if next <= now {
                    job.last_run = Some(now);
                    job.next_run = compute_next_run(&job.schedule, &now).ok().flatten();
                    due.push(job.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.persist();
        }
        due
    }

    /// Run the scheduler until cancelled, firing due jobs into `bus`.
    pub async fn run(&self, bus: std::sync::Arc<MessageBus>, cancel: CancellationToken) {
        info!("cron scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("cron scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            for job in self.take_due(Utc::now()) {
                debug!(job = %job.id, "firing cron job");
                let msg = InboundMessage {
                    channel: job.channel.clone(),
                    sender_id: "cron".into(),
                    chat_id: job.chat_id.clone(),
                    content: job.message.clone(),
                    timestamp: Utc::now(),
                    media: Vec::new(),
                    metadata: [(
                        "trace_id".to_string(),
                        serde_json::json!(format!("cron-{}-{}", job.id, Utc::now().timestamp())),
                    )]
                    .into_iter()
                    .collect(),
                };
                if let Err(e) = bus.publish_inbound_async(msg).await {
                    warn!(job = %job.id, error = %e, "failed to fire cron job");
                }
            }
        }
    }

    fn persist(&self) {
        let snapshot = self.jobs.lock().unwrap().clone();
        let content = match serde_json::to_string_pretty(&snapshot) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to serialize cron jobs");
                return;
            }
        };
        if let Some(parent) = self.storage_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.storage_path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, &self.storage_path)) {
            warn!(error = %e, "failed to persist cron jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (CronService, TempDir) {
        let dir = TempDir::new().unwrap();
        (CronService::new(dir.path().join("jobs.json")), dir)
    }

    #[test]
    fn add_and_list_jobs() {
        let (svc, _dir) = service();
        let id = svc
            .add_job("morning brief", "0 8 * * *", "summarize today's plan", "cli", "direct")
            .unwrap();
        let jobs = svc.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        // 5-field expression gets a seconds column.
        assert_eq!(jobs[0].schedule, "0 0 8 * * *");
        assert!(jobs[0].next_run.is_some());
    }

    #[test]
    fn invalid_expression_rejected() {
        let (svc, _dir) = service();
        let err = svc
            .add_job("bad", "not a cron expr", "x", "cli", "direct")
            .unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn remove_job_by_id() {
        let (svc, _dir) = service();
        let id = svc.add_job("j", "0 * * * *", "x", "cli", "c").unwrap();
        assert!(svc.remove_job(&id));
        assert!(!svc.remove_job(&id));
        assert!(svc.list_jobs().is_empty());
    }

    #[test]
    fn jobs_persist_across_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let id = {
            let svc = CronService::new(path.clone());
            svc.add_job("persisted", "0 12 * * *", "lunch reminder", "web", "c1")
                .unwrap()
        };
        let svc = CronService::new(path);
        let jobs = svc.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].message, "lunch reminder");
    }

    #[test]
    fn take_due_fires_and_advances() {
        let (svc, _dir) = service();
        // Every second, so it is due almost immediately.
        svc.add_job("tick", "* * * * * *", "ping", "cli", "c").unwrap();
        let later = Utc::now() + chrono::Duration::seconds(2);
        let due = svc.take_due(later);
        assert_eq!(due.len(), 1);
        let jobs = svc.list_jobs();
        assert!(jobs[0].last_run.is_some());
        assert!(jobs[0].next_run.unwrap() > later);
        // Not due again at the same instant.
        assert!(svc.take_due(later).is_empty());
    }

    #[test]
    fn disabled_jobs_never_fire() {
        let (svc, _dir) = service();
        svc.add_job("off", "* * * * * *", "x", "cli", "c").unwrap();
        svc.jobs.lock().unwrap()[0].enabled = false;
        let later = Utc::now() + chrono::Duration::seconds(2);
        assert!(svc.take_due(later).is_empty());
    }
}
