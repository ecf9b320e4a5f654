//! Scheduler (Sc), §4.9 — ticks `ScheduledJob`s, runs their instruction as
//! a turn, and tracks consecutive failures in a fixed-size ring buffer.
//!
//! Distinct from [`super::schedule_runner::ScheduleRunner`], the teacher's
//! own scheduler for its richer digest/fetch `Schedule` model: that one
//! keeps running on its own `cooldown_minutes` backoff for upstream
//! fetch/digest retries, unrelated to this module's job execution policy.
//!
//! Failure policy (§4.9): on failure, retry once after `retry_delay_secs`;
//! if that retry also fails, the job is marked `DisabledByError` after
//! `disable_after_failures` consecutive failures and a notification is
//! sent (via the configured `notification_channel`, best-effort).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use sa_domain::config::SchedulerConfig;
use sa_domain::orchestration::{ScheduleStatus, ScheduledJob};

use crate::runtime::schedules::cron;
use crate::runtime::{TurnEvent, TurnInput};
use crate::state::AppState;

/// One entry in a job's error ring buffer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleErrorEntry {
    pub occurred_at: chrono::DateTime<Utc>,
    pub message: String,
}

struct JobRuntime {
    job: ScheduledJob,
    errors: VecDeque<ScheduleErrorEntry>,
    /// Set when a first failure is awaiting its single retry.
    retry_at: Option<chrono::DateTime<Utc>>,
}

/// Persisted + in-memory scheduler state for every registered job.
pub struct OrchestrationScheduler {
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, JobRuntime>>,
    state_path: std::path::PathBuf,
}

impl OrchestrationScheduler {
    pub fn new(config: SchedulerConfig, state_path: std::path::PathBuf) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            state_path: state_path.join("scheduled_jobs.json"),
        });
        scheduler.load();
        scheduler
    }

    fn load(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        let Ok(jobs) = serde_json::from_str::<Vec<ScheduledJob>>(&raw) else {
            return;
        };
        let mut guard = self.jobs.write();
        for job in jobs {
            guard.insert(
                job.id.clone(),
                JobRuntime {
                    job,
                    errors: VecDeque::new(),
                    retry_at: None,
                },
            );
        }
    }

    fn persist(&self) {
        let jobs: Vec<ScheduledJob> = self.jobs.read().values().map(|r| r.job.clone()).collect();
        if let Ok(json) = serde_json::to_string_pretty(&jobs) {
            if let Err(e) = std::fs::write(&self.state_path, json) {
                tracing::warn!(error = %e, "orchestration scheduler persist failed");
            }
        }
    }

    pub fn register(&self, job: ScheduledJob) {
        let id = job.id.clone();
        self.jobs.write().insert(
            id,
            JobRuntime {
                job,
                errors: VecDeque::new(),
                retry_at: None,
            },
        );
        self.persist();
    }

    pub fn remove(&self, job_id: &str) -> bool {
        let removed = self.jobs.write().remove(job_id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        self.jobs.read().values().map(|r| r.job.clone()).collect()
    }

    pub fn errors_for(&self, job_id: &str) -> Vec<ScheduleErrorEntry> {
        self.jobs
            .read()
            .get(job_id)
            .map(|r| r.errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate every active job against `now`, running anything due.
    /// Jobs with a pending retry are evaluated against `retry_at` instead
    /// of the cron schedule.
    pub async fn tick(state: &AppState) {
        let scheduler = &state.orchestration_scheduler;
        let now = Utc::now();

        let due: Vec<ScheduledJob> = {
            let guard = scheduler.jobs.read();
            guard
                .values()
                .filter(|r| r.job.enabled && r.job.status != ScheduleStatus::DisabledByError)
                .filter(|r| match r.retry_at {
                    Some(retry_at) => now >= retry_at,
                    None => cron::cron_matches(&r.job.cron_expression, &now),
                })
                .map(|r| r.job.clone())
                .collect()
        };

        for job in due {
            scheduler.run_job(state, &job.id).await;
        }
    }

    async fn run_job(&self, state: &AppState, job_id: &str) {
        let job = match self.jobs.read().get(job_id) {
            Some(r) => r.job.clone(),
            None => return,
        };

        let is_retry = self
            .jobs
            .read()
            .get(job_id)
            .is_some_and(|r| r.retry_at.is_some());

        tracing::info!(job_id, name = %job.name, is_retry, "scheduled job firing");

        let session_key = format!("schedule:{job_id}");
        let input = TurnInput {
            session_key: session_key.clone(),
            session_id: job_id.to_string(),
            user_message: job.instruction.clone(),
            model: None,
            response_format: None,
            agent: None,
            routing_profile: None,
        };

        let (_, mut rx) = super::run_turn(state.clone(), input);
        let mut last_error: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Error { message } => last_error = Some(message),
                TurnEvent::Final { .. } => {}
                _ => {}
            }
        }

        match last_error {
            None => self.record_success(state, job_id).await,
            Some(err) => self.record_failure(state, job_id, &err, is_retry).await,
        }

        if job.one_shot {
            self.remove(job_id);
        }
    }

    async fn record_success(&self, state: &AppState, job_id: &str) {
        let job_snapshot = {
            let mut guard = self.jobs.write();
            let Some(r) = guard.get_mut(job_id) else {
                return;
            };
            r.job.consecutive_failures = 0;
            r.job.last_run_at = Some(Utc::now());
            r.job.last_result = Some("ok".into());
            r.job.status = ScheduleStatus::Active;
            r.retry_at = None;
            r.job.clone()
        };
        self.persist();

        if job_snapshot.notification_channel.is_some() {
            let body = format!("[{}] result: ok", job_snapshot.name);
            notify_result(state, &job_snapshot, body).await;
        }
    }

    async fn record_failure(&self, state: &AppState, job_id: &str, message: &str, was_retry: bool) {
        let (job_snapshot, should_disable, should_retry) = {
            let mut guard = self.jobs.write();
            let Some(r) = guard.get_mut(job_id) else {
                return;
            };
            r.job.consecutive_failures += 1;
            r.job.last_run_at = Some(Utc::now());
            r.job.last_result = Some(format!("error: {message}"));
            r.job.last_error_at = Some(Utc::now());

            if r.errors.len() >= self.config.ring_buffer_size {
                r.errors.pop_front();
            }
            r.errors.push_back(ScheduleErrorEntry {
                occurred_at: Utc::now(),
                message: message.to_string(),
            });

            let should_disable = r.job.consecutive_failures >= self.config.disable_after_failures;
            if should_disable {
                r.job.status = ScheduleStatus::DisabledByError;
                r.retry_at = None;
            }

            // Only schedule the single retry on the first failure in a
            // streak that hasn't already been retried.
            let should_retry = !should_disable && !was_retry;
            if should_retry {
                r.retry_at = Some(
                    Utc::now() + chrono::Duration::seconds(self.config.retry_delay_secs as i64),
                );
            } else if !should_disable {
                r.retry_at = None;
            }

            (r.job.clone(), should_disable, should_retry)
        };
        self.persist();

        tracing::warn!(
            job_id,
            consecutive_failures = job_snapshot.consecutive_failures,
            should_disable,
            should_retry,
            error = message,
            "scheduled job failed"
        );

        // Auto-disable is always notified; a non-disabling failure is only
        // notified when the job has an explicit notification_channel.
        if should_disable {
            let body = format!(
                "Scheduled job '{}' was disabled after {} consecutive failures. Last error: {message}",
                job_snapshot.name, job_snapshot.consecutive_failures
            );
            notify_result(state, &job_snapshot, body).await;
        } else if job_snapshot.notification_channel.is_some() {
            let body = format!("[{}] result: error: {message}", job_snapshot.name);
            notify_result(state, &job_snapshot, body).await;
        }
    }
}

/// Best-effort notification delivered through the existing `DeliveryStore`
/// (the same in-app notification channel the teacher's own digest scheduler
/// uses), tagged with the job's `notification_channel`, if any.
async fn notify_result(state: &AppState, job: &ScheduledJob, body: String) {
    let mut delivery = super::deliveries::Delivery::new(format!("[{}]", job.name), body);
    delivery.metadata = serde_json::json!({
        "orchestration_job_id": job.id,
        "notification_channel": job.notification_channel,
    });
    state.delivery_store.insert(delivery).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(cron_expr: &str) -> ScheduledJob {
        ScheduledJob::new("test job", cron_expr, "do the thing")
    }

    #[test]
    fn register_and_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = OrchestrationScheduler::new(SchedulerConfig::default(), dir.path().to_path_buf());
        let j = job("* * * * *");
        let id = j.id.clone();
        scheduler.register(j);
        let jobs = scheduler.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
    }

    #[test]
    fn remove_deletes_job() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = OrchestrationScheduler::new(SchedulerConfig::default(), dir.path().to_path_buf());
        let j = job("* * * * *");
        let id = j.id.clone();
        scheduler.register(j);
        assert!(scheduler.remove(&id));
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let scheduler =
                OrchestrationScheduler::new(SchedulerConfig::default(), dir.path().to_path_buf());
            let j = job("0 9 * * *");
            let id = j.id.clone();
            scheduler.register(j);
            id
        };
        let scheduler2 =
            OrchestrationScheduler::new(SchedulerConfig::default(), dir.path().to_path_buf());
        assert_eq!(scheduler2.list().len(), 1);
        assert_eq!(scheduler2.list()[0].id, id);
    }

    #[test]
    fn record_failure_schedules_single_retry_then_disables() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = OrchestrationScheduler::new(
            SchedulerConfig {
                disable_after_failures: 2,
                ..SchedulerConfig::default()
            },
            dir.path().to_path_buf(),
        );
        let j = job("* * * * *");
        let id = j.id.clone();
        scheduler.register(j);

        // First failure: schedules a retry, not yet disabled.
        {
            let mut guard = scheduler.jobs.write();
            let r = guard.get_mut(&id).unwrap();
            r.job.consecutive_failures += 1;
            r.errors.push_back(ScheduleErrorEntry {
                occurred_at: Utc::now(),
                message: "boom".into(),
            });
            r.retry_at = Some(Utc::now() + chrono::Duration::seconds(60));
        }
        let jobs = scheduler.list();
        assert_eq!(jobs[0].consecutive_failures, 1);
        assert_eq!(jobs[0].status, ScheduleStatus::Active);

        // Second failure reaches disable_after_failures=2.
        {
            let mut guard = scheduler.jobs.write();
            let r = guard.get_mut(&id).unwrap();
            r.job.consecutive_failures += 1;
            r.job.status = ScheduleStatus::DisabledByError;
        }
        assert_eq!(scheduler.list()[0].status, ScheduleStatus::DisabledByError);
    }

    #[test]
    fn ring_buffer_caps_error_history() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = OrchestrationScheduler::new(
            SchedulerConfig {
                ring_buffer_size: 3,
                ..SchedulerConfig::default()
            },
            dir.path().to_path_buf(),
        );
        let j = job("* * * * *");
        let id = j.id.clone();
        scheduler.register(j);

        let mut guard = scheduler.jobs.write();
        let r = guard.get_mut(&id).unwrap();
        for i in 0..5 {
            if r.errors.len() >= 3 {
                r.errors.pop_front();
            }
            r.errors.push_back(ScheduleErrorEntry {
                occurred_at: Utc::now(),
                message: format!("error {i}"),
            });
        }
        drop(guard);
        assert_eq!(scheduler.errors_for(&id).len(), 3);
        assert_eq!(scheduler.errors_for(&id)[0].message, "error 2");
    }
}
