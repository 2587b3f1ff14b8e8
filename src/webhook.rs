//! Externally authenticated conversion pushes.
//!
//! A webhook is registered per counter and gets a random shared secret. Each
//! authenticated submission becomes a [`WebhookBatch`] that is formatted,
//! uploaded and reconciled in the background exactly like a task upload.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ScoreError};
use crate::formatter::Conversion;
use crate::metrika::CounterAuth;
use crate::reconciler::{UploadReconciler, validate_auth};
use crate::state_machine::{UploadReport, UploadStatus, WebhookBatch};
use crate::store::Store;

pub const WEBHOOK_PATH: &str = "/webhook/offline-conversions";
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub counter: u64,
    pub token: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

/// Returned once, at registration. The secret is not shown again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub webhook_id: String,
    pub secret: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    pub batch_id: String,
    pub accepted: usize,
    pub status: UploadStatus,
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

pub struct WebhookService {
    store: Arc<dyn Store>,
    reconciler: UploadReconciler,
    base_url: String,
}

impl WebhookService {
    pub fn new(store: Arc<dyn Store>, reconciler: UploadReconciler, base_url: &str) -> Self {
        Self {
            store,
            reconciler,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn register(&self, name: &str, counter: u64, token: &str) -> Result<Registration> {
        if name.trim().is_empty() {
            return Err(ScoreError::Validation("webhook name must not be empty".into()));
        }
        validate_auth(&CounterAuth::new(counter, token))?;

        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            counter,
            token: token.to_string(),
            secret: generate_secret(),
            created_at: Utc::now(),
        };
        self.store.put_webhook(&webhook).await?;
        info!(webhook_id = %webhook.id, counter, name = %webhook.name, "webhook registered");

        Ok(Registration {
            url: format!("{}{}/{}", self.base_url, WEBHOOK_PATH, webhook.id),
            webhook_id: webhook.id,
            secret: webhook.secret,
        })
    }

    /// Missing secret is rejected before the webhook is even looked up.
    async fn authenticate(&self, webhook_id: &str, secret: Option<&str>) -> Result<Webhook> {
        let secret = secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScoreError::Unauthorized("missing webhook secret".into()))?;
        let webhook = self
            .store
            .get_webhook(webhook_id)
            .await?
            .ok_or_else(|| ScoreError::not_found("webhook", webhook_id))?;
        if !constant_time_eq(secret.as_bytes(), webhook.secret.as_bytes()) {
            return Err(ScoreError::Unauthorized("invalid webhook secret".into()));
        }
        Ok(webhook)
    }

    /// Accept a batch and upload it in the background.
    pub async fn submit(
        &self,
        webhook_id: &str,
        secret: Option<&str>,
        conversions: Vec<Conversion>,
    ) -> Result<Accepted> {
        let (webhook, accepted) = self.store_batch(webhook_id, secret, conversions).await?;
        self.reconciler.spawn_batch_delivery(
            accepted.batch_id.clone(),
            CounterAuth::new(webhook.counter, webhook.token),
        );
        Ok(accepted)
    }

    /// Store a batch as `pending` without uploading it. Pair with [`Self::deliver`].
    pub async fn accept(
        &self,
        webhook_id: &str,
        secret: Option<&str>,
        conversions: Vec<Conversion>,
    ) -> Result<Accepted> {
        let (_, accepted) = self.store_batch(webhook_id, secret, conversions).await?;
        Ok(accepted)
    }

    async fn store_batch(
        &self,
        webhook_id: &str,
        secret: Option<&str>,
        conversions: Vec<Conversion>,
    ) -> Result<(Webhook, Accepted)> {
        let webhook = self.authenticate(webhook_id, secret).await?;
        if conversions.is_empty() {
            return Err(ScoreError::Validation("conversion list is empty".into()));
        }
        for (idx, conversion) in conversions.iter().enumerate() {
            conversion.validate().map_err(|e| match e {
                ScoreError::Validation(msg) => {
                    ScoreError::Validation(format!("conversion {idx}: {msg}"))
                }
                other => other,
            })?;
        }

        let batch = WebhookBatch::new(&webhook.id, conversions.len());
        self.store
            .put_batch_conversions(&batch.id, &conversions)
            .await?;
        self.store.put_batch(&batch).await?;
        info!(webhook_id = %webhook.id, batch_id = %batch.id, conversions = conversions.len(), "webhook batch accepted");

        let accepted = Accepted {
            batch_id: batch.id,
            accepted: conversions.len(),
            status: batch.state.status,
        };
        Ok((webhook, accepted))
    }

    /// Upload an accepted batch now and return its status afterwards.
    pub async fn deliver(
        &self,
        webhook_id: &str,
        secret: Option<&str>,
        batch_id: &str,
    ) -> Result<UploadReport> {
        let webhook = self.authenticate(webhook_id, secret).await?;
        let batch = self.owned_batch(&webhook, batch_id).await?;
        let auth = CounterAuth::new(webhook.counter, webhook.token);
        self.reconciler.deliver_batch(&batch.id, auth).await
    }

    async fn owned_batch(&self, webhook: &Webhook, batch_id: &str) -> Result<WebhookBatch> {
        self.store
            .get_batch(batch_id)
            .await?
            .filter(|b| b.webhook_id == webhook.id)
            .ok_or_else(|| ScoreError::not_found("batch", batch_id))
    }

    /// Status of a batch owned by the authenticated webhook.
    pub async fn batch_status(
        &self,
        webhook_id: &str,
        secret: Option<&str>,
        batch_id: &str,
    ) -> Result<UploadReport> {
        let webhook = self.authenticate(webhook_id, secret).await?;
        let batch = self.owned_batch(&webhook, batch_id).await?;
        let auth = CounterAuth::new(webhook.counter, webhook.token);
        self.reconciler.batch_status(batch, &auth).await
    }
}
