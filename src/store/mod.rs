//! Persistence of jobs, results, uploads and webhooks.
//!
//! Every write replaces a single record, so concurrent jobs and uploads never
//! contend on shared state beyond the store itself.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::formatter::Conversion;
use crate::pipeline::VisitResult;
use crate::state_machine::{ConversionUpload, Job, WebhookBatch};
use crate::webhook::Webhook;

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Insert or replace the result list of a task.
    async fn upsert_result(&self, task_id: &str, visits: &[VisitResult]) -> Result<()>;
    async fn get_result(&self, task_id: &str) -> Result<Option<Vec<VisitResult>>>;

    async fn put_upload(&self, upload: &ConversionUpload) -> Result<()>;
    async fn get_upload(&self, id: &str) -> Result<Option<ConversionUpload>>;
    /// Oldest first.
    async fn uploads_for_task(&self, task_id: &str) -> Result<Vec<ConversionUpload>>;

    async fn put_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn get_webhook(&self, id: &str) -> Result<Option<Webhook>>;

    async fn put_batch(&self, batch: &WebhookBatch) -> Result<()>;
    async fn get_batch(&self, id: &str) -> Result<Option<WebhookBatch>>;
    async fn put_batch_conversions(&self, batch_id: &str, conversions: &[Conversion])
    -> Result<()>;
    async fn get_batch_conversions(&self, batch_id: &str) -> Result<Option<Vec<Conversion>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Lost when the process exits; for tests and one-shot embedding.
    Memory,
    /// Survives between CLI invocations.
    #[default]
    File,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Root directory of the `file` backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    Ok(match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(&config.path).await?),
    })
}
