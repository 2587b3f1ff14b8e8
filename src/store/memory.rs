use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Store;
use crate::error::Result;
use crate::formatter::Conversion;
use crate::pipeline::VisitResult;
use crate::state_machine::{ConversionUpload, Job, WebhookBatch};
use crate::webhook::Webhook;

struct Table<T>(RwLock<HashMap<String, T>>);

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self(RwLock::new(HashMap::new()))
    }

    async fn put(&self, id: &str, value: T) {
        self.0.write().await.insert(id.to_string(), value);
    }

    async fn get(&self, id: &str) -> Option<T> {
        self.0.read().await.get(id).cloned()
    }
}

/// Process-local store. Contents are lost on exit.
pub struct MemoryStore {
    jobs: Table<Job>,
    results: Table<Vec<VisitResult>>,
    uploads: Table<ConversionUpload>,
    webhooks: Table<Webhook>,
    batches: Table<WebhookBatch>,
    batch_conversions: Table<Vec<Conversion>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: Table::new(),
            results: Table::new(),
            uploads: Table::new(),
            webhooks: Table::new(),
            batches: Table::new(),
            batch_conversions: Table::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_job(&self, job: &Job) -> Result<()> {
        self.jobs.put(&job.id, job.clone()).await;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).await)
    }

    async fn upsert_result(&self, task_id: &str, visits: &[VisitResult]) -> Result<()> {
        self.results.put(task_id, visits.to_vec()).await;
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<Vec<VisitResult>>> {
        Ok(self.results.get(task_id).await)
    }

    async fn put_upload(&self, upload: &ConversionUpload) -> Result<()> {
        self.uploads.put(&upload.id, upload.clone()).await;
        Ok(())
    }

    async fn get_upload(&self, id: &str) -> Result<Option<ConversionUpload>> {
        Ok(self.uploads.get(id).await)
    }

    async fn uploads_for_task(&self, task_id: &str) -> Result<Vec<ConversionUpload>> {
        let mut found: Vec<ConversionUpload> = self
            .uploads
            .0
            .read()
            .await
            .values()
            .filter(|u| u.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        found.sort_by_key(|u| u.state.created_at);
        Ok(found)
    }

    async fn put_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks.put(&webhook.id, webhook.clone()).await;
        Ok(())
    }

    async fn get_webhook(&self, id: &str) -> Result<Option<Webhook>> {
        Ok(self.webhooks.get(id).await)
    }

    async fn put_batch(&self, batch: &WebhookBatch) -> Result<()> {
        self.batches.put(&batch.id, batch.clone()).await;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<WebhookBatch>> {
        Ok(self.batches.get(id).await)
    }

    async fn put_batch_conversions(
        &self,
        batch_id: &str,
        conversions: &[Conversion],
    ) -> Result<()> {
        self.batch_conversions
            .put(batch_id, conversions.to_vec())
            .await;
        Ok(())
    }

    async fn get_batch_conversions(&self, batch_id: &str) -> Result<Option<Vec<Conversion>>> {
        Ok(self.batch_conversions.get(batch_id).await)
    }
}
