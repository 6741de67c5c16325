/// Scheduled job definitions
///
/// Cron expressions are accepted in the classic five-field form and get a
/// leading seconds field of `0`; six- and seven-field expressions pass through.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    /// Compiled program executed on every fire
    pub flow_version_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ScheduleJob {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        flow_version_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            flow_version_id: flow_version_id.into(),
            project_id: None,
            tenant_id: None,
            is_active: true,
        }
    }

    /// Scheduler-facing job id
    pub fn job_id(&self) -> String {
        format!("schedule_{}", self.id)
    }

    /// Expression with an explicit seconds field
    pub fn normalized_cron(&self) -> String {
        normalize_cron(&self.cron_expression)
    }

    pub fn cron_schedule(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.normalized_cron())
            .with_context(|| format!("Invalid cron expression for schedule {}: '{}'", self.id, self.cron_expression))
    }

    /// Next tick strictly after now (UTC)
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.cron_schedule().ok()?.upcoming(Utc).next()
    }
}

pub fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}
