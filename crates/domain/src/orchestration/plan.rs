use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// A versioned plan written by the `setChapoPlan` control tool (§4.5.5),
/// stored at `ConversationState.taskContext.gathered_info["chapoPlan"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub version: u32,
    pub title: String,
    pub steps: Vec<PlanStep>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub text: String,
    pub owner: StepOwner,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOwner {
    Chapo,
    Devo,
    Scout,
    Caio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Todo,
    Doing,
    Done,
    Blocked,
}

impl Plan {
    /// Validate and build a new plan version, bumping `version` from the
    /// previous plan (if any).  Validation rules per §4.5.5: non-empty
    /// title, >=1 step, unique ids, at most one `doing`.
    pub fn new_version(
        previous: Option<&Plan>,
        title: impl Into<String>,
        steps: Vec<PlanStep>,
    ) -> Result<Plan> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(Error::Other("plan title must not be empty".into()));
        }
        if steps.is_empty() {
            return Err(Error::Other("plan must have at least one step".into()));
        }

        let mut seen_ids = HashSet::new();
        let mut doing_count = 0;
        for step in &steps {
            if !seen_ids.insert(step.id.as_str()) {
                return Err(Error::Other(format!("duplicate step id \"{}\"", step.id)));
            }
            if step.status == StepStatus::Doing {
                doing_count += 1;
            }
        }
        if doing_count > 1 {
            return Err(Error::Other("at most one step may be \"doing\"".into()));
        }

        let (plan_id, version) = match previous {
            Some(p) => (p.plan_id.clone(), p.version + 1),
            None => (uuid::Uuid::new_v4().to_string(), 1),
        };

        Ok(Plan {
            plan_id,
            version,
            title,
            steps,
            updated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, status: StepStatus) -> PlanStep {
        PlanStep {
            id: id.into(),
            text: format!("step {id}"),
            owner: StepOwner::Devo,
            status,
        }
    }

    #[test]
    fn first_version_starts_at_one() {
        let plan = Plan::new_version(None, "Ship feature", vec![step("1", StepStatus::Todo)]).unwrap();
        assert_eq!(plan.version, 1);
    }

    #[test]
    fn subsequent_version_bumps_and_keeps_plan_id() {
        let v1 = Plan::new_version(None, "Ship feature", vec![step("1", StepStatus::Todo)]).unwrap();
        let v2 = Plan::new_version(Some(&v1), "Ship feature", vec![step("1", StepStatus::Doing)]).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.plan_id, v1.plan_id);
    }

    #[test]
    fn empty_title_rejected() {
        assert!(Plan::new_version(None, "  ", vec![step("1", StepStatus::Todo)]).is_err());
    }

    #[test]
    fn empty_steps_rejected() {
        assert!(Plan::new_version(None, "Ship feature", vec![]).is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let steps = vec![step("1", StepStatus::Todo), step("1", StepStatus::Done)];
        assert!(Plan::new_version(None, "Ship feature", steps).is_err());
    }

    #[test]
    fn more_than_one_doing_rejected() {
        let steps = vec![step("1", StepStatus::Doing), step("2", StepStatus::Doing)];
        assert!(Plan::new_version(None, "Ship feature", steps).is_err());
    }

    #[test]
    fn exactly_one_doing_ok() {
        let steps = vec![step("1", StepStatus::Doing), step("2", StepStatus::Todo)];
        assert!(Plan::new_version(None, "Ship feature", steps).is_ok());
    }
}
