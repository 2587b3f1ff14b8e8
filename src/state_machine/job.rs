use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Lifecycle, TransitionError};
use crate::error::{Result, ScoreError};

/// Lifecycle of one scoring run: `pending → running → {done | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl Lifecycle for JobStatus {
    const KIND: &'static str = "task";

    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    fn allows(self, next: Self) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// The request that started a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub token: String,
    pub counter: u64,
}

impl TaskParams {
    pub fn new(date: impl Into<String>, token: impl Into<String>, counter: u64) -> Result<Self> {
        let params = Self {
            date: date.into(),
            token: token.into(),
            counter,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        validate_date(&self.date)?;
        if self.counter == 0 {
            return Err(ScoreError::Validation(
                "counter must be a positive integer".into(),
            ));
        }
        if self.token.trim().is_empty() {
            return Err(ScoreError::Validation("token must not be empty".into()));
        }
        Ok(())
    }
}

/// Accepts only the unambiguous `YYYY-MM-DD` form of a real calendar date.
pub(crate) fn validate_date(date: &str) -> Result<NaiveDate> {
    let shaped = date.len() == 10
        && date.char_indices().all(|(i, c)| match i {
            4 | 7 => c == '-',
            _ => c.is_ascii_digit(),
        });
    if !shaped {
        return Err(ScoreError::Validation(format!(
            "date must be YYYY-MM-DD, got '{date}'"
        )));
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| ScoreError::Validation(format!("'{date}' is not a calendar date")))
}

/// One scoring run, addressable by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// 0..=100, never decreases.
    pub progress: u8,
    pub message: String,
    pub params: TaskParams,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the job is done or failed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set iff the job failed.
    pub error: Option<String>,
}

impl Job {
    pub fn new(params: TaskParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Task created".into(),
            params,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self, progress: u8, message: impl Into<String>) -> Result<(), TransitionError> {
        self.status.check(JobStatus::Running)?;
        let progress = self.checked_progress(progress)?;
        self.status = JobStatus::Running;
        self.progress = progress;
        self.message = message.into();
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Progress checkpoint while running.
    pub fn advance(&mut self, progress: u8, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError::Inactive {
                kind: JobStatus::KIND,
                state: self.status.to_string(),
            });
        }
        self.progress = self.checked_progress(progress)?;
        self.message = message.into();
        Ok(())
    }

    pub fn complete(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.status.check(JobStatus::Done)?;
        self.status = JobStatus::Done;
        self.progress = 100;
        self.message = message.into();
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.status.check(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.progress = 100;
        self.message = "Task failed".into();
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn checked_progress(&self, progress: u8) -> Result<u8, TransitionError> {
        let progress = progress.min(100);
        if progress < self.progress {
            return Err(TransitionError::ProgressRegression {
                from: self.progress,
                to: progress,
            });
        }
        Ok(progress)
    }
}
