use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scheduled job registered with the Scheduler (§4.9). Distinct from the
/// richer `Schedule`/digest model in `sa-gateway::runtime::schedules`,
/// which wraps this with fetch/digest/delivery configuration — this is the
/// spec-minimal shape persisted as `scheduled_jobs` rows (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub instruction: String,
    #[serde(default)]
    pub notification_channel: Option<String>,
    pub enabled: bool,
    pub one_shot: bool,
    pub status: ScheduleStatus,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    DisabledByError,
    Paused,
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            instruction: instruction.into(),
            notification_channel: None,
            enabled: true,
            one_shot: false,
            status: ScheduleStatus::Active,
            consecutive_failures: 0,
            last_run_at: None,
            last_result: None,
            last_error_at: None,
        }
    }
}
