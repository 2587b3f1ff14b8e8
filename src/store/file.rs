use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::Store;
use crate::error::{Result, ScoreError};
use crate::formatter::Conversion;
use crate::pipeline::VisitResult;
use crate::state_machine::{ConversionUpload, Job, WebhookBatch};
use crate::webhook::Webhook;

const JOBS: &str = "jobs";
const RESULTS: &str = "results";
const UPLOADS: &str = "uploads";
const WEBHOOKS: &str = "webhooks";
const BATCHES: &str = "batches";
const BATCH_CONVERSIONS: &str = "batch_conversions";

/// One pretty-printed JSON file per record: `<root>/<collection>/<id>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for collection in [JOBS, RESULTS, UPLOADS, WEBHOOKS, BATCHES, BATCH_CONVERSIONS] {
            fs::create_dir_all(root.join(collection)).await?;
        }
        Ok(Self { root })
    }

    /// `None` for ids that could escape the collection directory.
    fn record_path(&self, collection: &str, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.root.join(collection).join(format!("{id}.json")))
    }

    async fn write<T: Serialize + Sync>(&self, collection: &str, id: &str, value: &T) -> Result<()> {
        let path = self
            .record_path(collection, id)
            .ok_or_else(|| ScoreError::Storage(format!("invalid record id '{id}'")))?;
        let json = serde_json::to_vec_pretty(value)?;
        // Write then rename so readers never see a half-written record.
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned + Send>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let Some(path) = self.record_path(collection, id) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            ScoreError::Storage(format!("corrupt record {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn put_job(&self, job: &Job) -> Result<()> {
        self.write(JOBS, &job.id, job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.read(JOBS, id).await
    }

    async fn upsert_result(&self, task_id: &str, visits: &[VisitResult]) -> Result<()> {
        self.write(RESULTS, task_id, &visits).await
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<Vec<VisitResult>>> {
        self.read(RESULTS, task_id).await
    }

    async fn put_upload(&self, upload: &ConversionUpload) -> Result<()> {
        self.write(UPLOADS, &upload.id, upload).await
    }

    async fn get_upload(&self, id: &str) -> Result<Option<ConversionUpload>> {
        self.read(UPLOADS, id).await
    }

    /// Scans every upload file; there is no per-task index.
    async fn uploads_for_task(&self, task_id: &str) -> Result<Vec<ConversionUpload>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(self.root.join(UPLOADS)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<ConversionUpload>(&bytes) {
                Ok(upload) if upload.task_id.as_deref() == Some(task_id) => found.push(upload),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable upload record"),
            }
        }
        found.sort_by_key(|u| u.state.created_at);
        Ok(found)
    }

    async fn put_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.write(WEBHOOKS, &webhook.id, webhook).await
    }

    async fn get_webhook(&self, id: &str) -> Result<Option<Webhook>> {
        self.read(WEBHOOKS, id).await
    }

    async fn put_batch(&self, batch: &WebhookBatch) -> Result<()> {
        self.write(BATCHES, &batch.id, batch).await
    }

    async fn get_batch(&self, id: &str) -> Result<Option<WebhookBatch>> {
        self.read(BATCHES, id).await
    }

    async fn put_batch_conversions(
        &self,
        batch_id: &str,
        conversions: &[Conversion],
    ) -> Result<()> {
        self.write(BATCH_CONVERSIONS, batch_id, &conversions).await
    }

    async fn get_batch_conversions(&self, batch_id: &str) -> Result<Option<Vec<Conversion>>> {
        self.read(BATCH_CONVERSIONS, batch_id).await
    }
}
