//! Submission of conversion payloads and reconciliation of their status.
//!
//! Submitting records the upload, pushes the CSV to Metrika and moves the
//! record to `uploaded`. A background loop then polls the provider with
//! bounded backoff until the upload settles (`completed` or `error`) or the
//! attempt budget runs out. Failures never propagate out of the loop: they are
//! logged and absorbed into the record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ScoreError};
use crate::formatter::{self, Conversion};
use crate::metrika::{CounterAuth, MetrikaApi, UploadingInfo};
use crate::state_machine::{
    ConversionUpload, JobStatus, RetryConfig, UploadReport, UploadState, UploadStatus,
    WebhookBatch,
};
use crate::store::Store;

/// A stored record carrying an [`UploadState`].
#[async_trait]
pub(crate) trait Tracked: Send + Sync + Sized + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn state(&self) -> &UploadState;
    fn state_mut(&mut self) -> &mut UploadState;
    fn report(&self) -> UploadReport;

    async fn load(store: &dyn Store, id: &str) -> Result<Option<Self>>;
    async fn save(&self, store: &dyn Store) -> Result<()>;
}

#[async_trait]
impl Tracked for ConversionUpload {
    const KIND: &'static str = "upload";

    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &UploadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UploadState {
        &mut self.state
    }

    fn report(&self) -> UploadReport {
        ConversionUpload::report(self)
    }

    async fn load(store: &dyn Store, id: &str) -> Result<Option<Self>> {
        store.get_upload(id).await
    }

    async fn save(&self, store: &dyn Store) -> Result<()> {
        store.put_upload(self).await
    }
}

#[async_trait]
impl Tracked for WebhookBatch {
    const KIND: &'static str = "batch";

    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &UploadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UploadState {
        &mut self.state
    }

    fn report(&self) -> UploadReport {
        WebhookBatch::report(self)
    }

    async fn load(store: &dyn Store, id: &str) -> Result<Option<Self>> {
        store.get_batch(id).await
    }

    async fn save(&self, store: &dyn Store) -> Result<()> {
        store.put_batch(self).await
    }
}

pub(crate) fn validate_auth(auth: &CounterAuth) -> Result<()> {
    if auth.counter == 0 {
        return Err(ScoreError::Validation(
            "counter must be a positive integer".into(),
        ));
    }
    if auth.token.trim().is_empty() {
        return Err(ScoreError::Validation("token must not be empty".into()));
    }
    Ok(())
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero())
}

/// Applies a provider report to a record. Illegal transitions are logged and
/// leave the stored status as it was.
fn apply_report<T: Tracked>(record: &mut T, info: &UploadingInfo) {
    let id = record.id().to_string();
    let before = record.state().status;
    match record
        .state_mut()
        .apply_provider_status(&info.status, info.line_quantity)
    {
        Ok(after) if after != before => {
            info!(kind = T::KIND, id = %id, from = %before, to = %after, provider_status = %info.status, "upload status changed");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(kind = T::KIND, id = %id, provider_status = %info.status, error = %e, "ignoring provider status");
        }
    }
}

#[derive(Clone)]
pub struct UploadReconciler {
    api: Arc<dyn MetrikaApi>,
    store: Arc<dyn Store>,
    retry: RetryConfig,
    shutdown: CancellationToken,
    /// Serializes load-modify-save of tracked records.
    updates: Arc<Mutex<()>>,
    /// Webhook batches currently being uploaded by this process.
    delivering: Arc<Mutex<HashSet<String>>>,
}

impl UploadReconciler {
    pub fn new(
        api: Arc<dyn MetrikaApi>,
        store: Arc<dyn Store>,
        retry: RetryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            store,
            retry,
            shutdown,
            updates: Arc::new(Mutex::new(())),
            delivering: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Upload the tier-4+ visits of a finished task as conversions of `target`.
    pub async fn submit_bulk(
        &self,
        task_id: &str,
        target: &str,
        auth: CounterAuth,
    ) -> Result<UploadReport> {
        if target.trim().is_empty() {
            return Err(ScoreError::Validation("target must not be empty".into()));
        }
        validate_auth(&auth)?;

        let job = self
            .store
            .get_job(task_id)
            .await?
            .ok_or_else(|| ScoreError::not_found("task", task_id))?;
        if job.status != JobStatus::Done {
            return Err(ScoreError::not_ready("task", task_id));
        }
        let visits = self
            .store
            .get_result(task_id)
            .await?
            .ok_or_else(|| ScoreError::ResultMissing(task_id.to_string()))?;

        let payload = formatter::format_bulk(&visits, target)?;
        if payload.skipped > 0 {
            warn!(task_id, skipped = payload.skipped, "some visits were left out of the upload");
        }
        let mut upload = ConversionUpload::new(
            Some(task_id.to_string()),
            auth.counter,
            auth.token.clone(),
            target,
            payload.rows,
        );
        if payload.rows == 0 {
            upload.state.mark_error("no visits with a client id and parseable timestamp to upload")?;
            self.store.put_upload(&upload).await?;
            warn!(task_id, upload_id = %upload.id, "nothing to upload");
            return Ok(upload.report());
        }
        self.store.put_upload(&upload).await?;
        info!(task_id, upload_id = %upload.id, rows = payload.rows, "submitting bulk conversions");
        self.submit(upload, payload.body, auth).await
    }

    /// Upload one manually supplied conversion. Validation happens before
    /// anything is stored or sent.
    pub async fn submit_single(
        &self,
        conversion: &Conversion,
        auth: CounterAuth,
    ) -> Result<UploadReport> {
        validate_auth(&auth)?;
        let body = formatter::format_single(conversion)?;
        let upload = ConversionUpload::new(
            None,
            auth.counter,
            auth.token.clone(),
            conversion.target.trim(),
            1,
        );
        self.store.put_upload(&upload).await?;
        info!(upload_id = %upload.id, target = %upload.target, "submitting single conversion");
        self.submit(upload, body, auth).await
    }

    /// Current status, refreshed from Metrika when the record is not settled.
    pub async fn upload_status(&self, upload_id: &str) -> Result<UploadReport> {
        let upload: ConversionUpload = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| ScoreError::not_found("upload", upload_id))?;
        let auth = CounterAuth::new(upload.counter, upload.token.clone());
        let upload = self.refresh(upload, &auth).await?;
        Ok(upload.report())
    }

    pub async fn uploads_for_task(&self, task_id: &str) -> Result<Vec<UploadReport>> {
        if self.store.get_job(task_id).await?.is_none() {
            return Err(ScoreError::not_found("task", task_id));
        }
        let uploads = self.store.uploads_for_task(task_id).await?;
        Ok(uploads.iter().map(ConversionUpload::report).collect())
    }

    /// Batch status, refreshed from Metrika. A batch that was accepted but
    /// never uploaded (its delivering process went away) is delivered now.
    pub(crate) async fn batch_status(&self, batch: WebhookBatch, auth: &CounterAuth) -> Result<UploadReport> {
        if batch.state.status == UploadStatus::Pending && batch.state.provider_upload_id.is_none() {
            return self.deliver_batch(&batch.id, auth.clone()).await;
        }
        Ok(self.refresh(batch, auth).await?.report())
    }

    /// Format and send a stored webhook batch in the background.
    pub(crate) fn spawn_batch_delivery(&self, batch_id: String, auth: CounterAuth) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.deliver_batch(&batch_id, auth).await {
                warn!(batch_id = %batch_id, error = %e, "webhook batch delivery failed");
            }
        });
    }

    /// Upload a pending batch once. Batches already uploaded, settled, or
    /// being uploaded by another task are reported as stored.
    pub(crate) async fn deliver_batch(&self, batch_id: &str, auth: CounterAuth) -> Result<UploadReport> {
        if !self.delivering.lock().await.insert(batch_id.to_string()) {
            debug!(batch_id, "batch delivery already in progress");
            return self.stored_batch(batch_id).await.map(|b| b.report());
        }
        let outcome = self.upload_batch(batch_id, auth).await;
        self.delivering.lock().await.remove(batch_id);
        outcome
    }

    async fn stored_batch(&self, batch_id: &str) -> Result<WebhookBatch> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| ScoreError::not_found("batch", batch_id))
    }

    async fn upload_batch(&self, batch_id: &str, auth: CounterAuth) -> Result<UploadReport> {
        let mut batch = self.stored_batch(batch_id).await?;
        if batch.state.status != UploadStatus::Pending || batch.state.provider_upload_id.is_some() {
            return Ok(batch.report());
        }
        let conversions = self
            .store
            .get_batch_conversions(batch_id)
            .await?
            .unwrap_or_default();

        let payload = formatter::format_webhook(&conversions)?;
        if payload.rows == 0 {
            batch
                .state
                .mark_error("no conversions with client_id to upload")?;
            batch.save(self.store.as_ref()).await?;
            return Ok(batch.report());
        }
        debug!(batch_id, rows = payload.rows, skipped = payload.skipped, "uploading webhook batch");
        self.submit(batch, payload.body, auth).await
    }

    /// Load the freshest stored copy of a record, apply `change` and save it.
    /// A record that settled in the meantime is returned untouched.
    async fn update<T, F>(&self, id: &str, change: F) -> Result<T>
    where
        T: Tracked,
        F: FnOnce(&mut T) + Send,
    {
        let _guard = self.updates.lock().await;
        let mut record = T::load(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| ScoreError::not_found(T::KIND, id))?;
        if record.state().is_settled() {
            return Ok(record);
        }
        change(&mut record);
        record.save(self.store.as_ref()).await?;
        Ok(record)
    }

    /// Push `body` to Metrika for an already stored pending record. A failed
    /// push is recorded as `error` rather than returned.
    async fn submit<T: Tracked>(
        &self,
        mut record: T,
        body: String,
        auth: CounterAuth,
    ) -> Result<UploadReport> {
        match self.api.upload_conversions(&auth, body).await {
            Ok(info) => {
                record.state_mut().mark_uploaded(info.id.clone())?;
                let first = after(self.retry.delay_for_attempt(1));
                record
                    .state_mut()
                    .reconcile
                    .scheduled(self.retry.max_attempts, first);
                record.save(self.store.as_ref()).await?;
                info!(kind = T::KIND, id = %record.id(), provider_upload_id = %info.id, "conversions uploaded");
                self.spawn_reconcile::<T>(record.id().to_string(), auth);
            }
            Err(e) => {
                warn!(kind = T::KIND, id = %record.id(), error = %e, "conversion upload rejected");
                record.state_mut().mark_error(e.to_string())?;
                record.save(self.store.as_ref()).await?;
            }
        }
        Ok(record.report())
    }

    async fn refresh<T: Tracked>(&self, record: T, auth: &CounterAuth) -> Result<T> {
        if record.state().is_settled() {
            return Ok(record);
        }
        let Some(provider_id) = record.state().provider_upload_id.clone() else {
            return Ok(record);
        };
        match self.api.upload_status(auth, &provider_id).await {
            Ok(info) => self.update(record.id(), |r: &mut T| apply_report(r, &info)).await,
            Err(e) => {
                warn!(kind = T::KIND, id = %record.id(), error = %e, "status refresh failed, returning stored state");
                Ok(record)
            }
        }
    }

    fn spawn_reconcile<T: Tracked>(&self, id: String, auth: CounterAuth) {
        let this = self.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move { this.reconcile_loop::<T>(id, auth, token).await });
    }

    async fn reconcile_loop<T: Tracked>(&self, id: String, auth: CounterAuth, token: CancellationToken) {
        let max = self.retry.max_attempts;
        for attempt in 1..=max {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(kind = T::KIND, id = %id, attempt, "reconciliation cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.retry.delay_for_attempt(attempt)) => {}
            }

            match self.poll_once::<T>(&id, &auth, attempt).await {
                Ok(true) => {
                    debug!(kind = T::KIND, id = %id, attempt, "upload settled");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(kind = T::KIND, id = %id, attempt, error = %e, "reconciliation attempt failed"),
            }
        }
        info!(kind = T::KIND, id = %id, attempts = max, "reconciliation attempts exhausted, keeping last status");
    }

    /// One status check. Returns whether polling should stop.
    async fn poll_once<T: Tracked>(&self, id: &str, auth: &CounterAuth, attempt: u32) -> Result<bool> {
        let record = T::load(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| ScoreError::not_found(T::KIND, id))?;
        if record.state().is_settled() {
            return Ok(true);
        }
        let Some(provider_id) = record.state().provider_upload_id.clone() else {
            return Ok(true);
        };

        let outcome = self.api.upload_status(auth, &provider_id).await;
        let retry = &self.retry;
        let record = self
            .update(id, |r: &mut T| {
                if let Ok(info) = &outcome {
                    apply_report(r, info);
                }
                let settled = r.state().is_settled();
                let next_at = (!settled && attempt < retry.max_attempts)
                    .then(|| after(retry.delay_for_attempt(attempt + 1)));
                r.state_mut().reconcile.attempted(next_at);
            })
            .await?;
        if record.state().is_settled() {
            return Ok(true);
        }
        outcome?;
        Ok(false)
    }
}
