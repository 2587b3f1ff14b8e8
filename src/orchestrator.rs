use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Result, ScoreError};
use crate::pipeline::{PipelineObserver, ScoringPipeline, VisitResult};
use crate::state_machine::{Job, JobStatus, TaskParams};
use crate::store::Store;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage {
    pub task_id: String,
    pub results: Vec<VisitResult>,
    pub pagination: Pagination,
}

/// Persists pipeline checkpoints onto the running job.
struct StoredCheckpoints {
    store: Arc<dyn Store>,
    job: Mutex<Job>,
}

#[async_trait]
impl PipelineObserver for StoredCheckpoints {
    async fn checkpoint(&self, progress: u8, message: &str) {
        let mut job = self.job.lock().await;
        if let Err(e) = job.advance(progress, message) {
            warn!(task_id = %job.id, error = %e, "ignoring progress update");
            return;
        }
        if let Err(e) = self.store.put_job(&job).await {
            warn!(task_id = %job.id, error = %e, "failed to persist progress");
        }
    }
}

/// Drives scoring jobs through `pending → running → {done | failed}`.
#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn Store>,
    pipeline: Arc<ScoringPipeline>,
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn Store>, pipeline: Arc<ScoringPipeline>) -> Self {
        Self { store, pipeline }
    }

    /// Validate, persist as `pending` and start the run in the background.
    pub async fn create_job(&self, params: TaskParams) -> Result<Job> {
        params.validate()?;
        let job = Job::new(params);
        self.store.put_job(&job).await?;
        info!(task_id = %job.id, date = %job.params.date, counter = job.params.counter, "task created");

        let this = self.clone();
        let id = job.id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_job(&id).await {
                error!(task_id = %id, error = %e, "task could not be driven to completion");
            }
        });
        Ok(job)
    }

    /// Run a pending job to its terminal state. Pipeline errors end up in the
    /// job record; only storage or state machine faults are returned.
    pub async fn run_job(&self, task_id: &str) -> Result<Job> {
        let mut job = self.job_status(task_id).await?;
        job.start(10, "Requesting logs from Metrika")?;
        self.store.put_job(&job).await?;

        let progress = StoredCheckpoints {
            store: Arc::clone(&self.store),
            job: Mutex::new(job.clone()),
        };
        let outcome = self.pipeline.run(&job.params, &progress).await;
        let mut job = progress.job.into_inner();

        let outcome = match outcome {
            Ok(visits) => self
                .store
                .upsert_result(&job.id, &visits)
                .await
                .map(|()| visits.len()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(found) => {
                job.complete(format!("Found {found} tier-4+ visits"))?;
                info!(task_id = %job.id, visits = found, "task done");
            }
            Err(e) => {
                job.fail(e.to_string())?;
                error!(task_id = %job.id, error = %e, "task failed");
            }
        }
        self.store.put_job(&job).await?;
        Ok(job)
    }

    pub async fn job_status(&self, task_id: &str) -> Result<Job> {
        self.store
            .get_job(task_id)
            .await?
            .ok_or_else(|| ScoreError::not_found("task", task_id))
    }

    pub async fn job_result(&self, task_id: &str, limit: usize, offset: usize) -> Result<ResultPage> {
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ScoreError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        let job = self.job_status(task_id).await?;
        if job.status != JobStatus::Done {
            return Err(ScoreError::not_ready("task", task_id));
        }
        let visits = self
            .store
            .get_result(task_id)
            .await?
            .ok_or_else(|| ScoreError::ResultMissing(task_id.to_string()))?;

        let total = visits.len();
        let results = visits.into_iter().skip(offset).take(limit).collect();
        Ok(ResultPage {
            task_id: task_id.to_string(),
            results,
            pagination: Pagination {
                total,
                limit,
                offset,
                has_more: offset.saturating_add(limit) < total,
            },
        })
    }

    /// Poll the stored job until it is done or failed.
    pub async fn wait_until_finished(
        &self,
        task_id: &str,
        interval: Duration,
        mut on_update: impl FnMut(&Job),
    ) -> Result<Job> {
        loop {
            let job = self.job_status(task_id).await?;
            on_update(&job);
            if job.is_finished() {
                return Ok(job);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
