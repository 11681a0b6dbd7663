use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CronError, Result};

/// A cron job definition as stored under `/cron/jobs/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(rename = "cronExpr", default)]
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// A job carrying only its name, used where the definition is unavailable
    /// (deletes and kill requests).
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "", "")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    /// Reject definitions no worker could schedule.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(CronError::Config(format!(
                "invalid job name '{}': must be non-empty and contain no '/'",
                self.name
            )));
        }
        parse_cron_expr(&self.cron_expr).map(|_| ())
    }
}

/// Parse a cron expression. Five-field crontab expressions get a zero
/// seconds field; six and seven field forms are seconds-first.
pub fn parse_cron_expr(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Upserted,
    Deleted,
    KillRequested,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Upserted => write!(f, "upserted"),
            JobEventKind::Deleted => write!(f, "deleted"),
            JobEventKind::KillRequested => write!(f, "kill-requested"),
        }
    }
}

/// A change to the job namespace, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

impl JobEvent {
    pub fn upserted(job: Job) -> Self {
        Self {
            kind: JobEventKind::Upserted,
            job,
        }
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Deleted,
            job: Job::named(name),
        }
    }

    pub fn kill_requested(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::KillRequested,
            job: Job::named(name),
        }
    }
}

/// A job together with its parsed schedule and next fire time.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub job: Job,
    pub schedule: Schedule,
    pub next_time: DateTime<Utc>,
}

impl SchedulePlan {
    pub fn build(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let schedule = parse_cron_expr(&job.cron_expr)?;
        let next_time =
            schedule
                .after(&now)
                .next()
                .ok_or_else(|| CronError::InvalidSchedule {
                    expr: job.cron_expr.clone(),
                    reason: "no upcoming fire time".to_string(),
                })?;

        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_time <= now
    }

    /// Move the next fire time to the first occurrence after `now`. Missed
    /// ticks are skipped, not replayed. Returns false when the schedule has
    /// no further occurrences.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match self.schedule.after(&now).next() {
            Some(next) => {
                self.next_time = next;
                true
            }
            None => false,
        }
    }
}

/// One in-flight execution on this node.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job: Job,
    pub plan_time: DateTime<Utc>,
    pub dispatch_time: DateTime<Utc>,
    /// Kill request: cancelling this terminates the running command.
    pub cancel: CancellationToken,
    /// Worker shutdown. Parent of `cancel`, so it also terminates the
    /// command, but the run is reported as interrupted rather than killed.
    pub interrupt: CancellationToken,
}

impl ExecutionRecord {
    pub fn new(job: Job, plan_time: DateTime<Utc>, dispatch_time: DateTime<Utc>) -> Self {
        let interrupt = CancellationToken::new();
        Self {
            id: Uuid::new_v4(),
            job,
            plan_time,
            dispatch_time,
            cancel: interrupt.child_token(),
            interrupt,
        }
    }
}

/// Outcome of one dispatched execution.
#[derive(Debug)]
pub struct ExecutionResult {
    pub record: ExecutionRecord,
    pub output: Vec<u8>,
    pub error: Option<CronError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionResult {
    /// True when this node lost the lock race and skipped the run.
    pub fn lost_lock(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(CronError::is_lock_contention)
    }
}
