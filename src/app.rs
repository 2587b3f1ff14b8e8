//! Builds the services from a [`ScoreConfig`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classifier::{ArtifactDirectory, Thresholds, TierClassifier};
use crate::config::ScoreConfig;
use crate::error::Result;
use crate::metrika::{MetrikaApi, MetrikaClient};
use crate::orchestrator::JobOrchestrator;
use crate::pipeline::ScoringPipeline;
use crate::reconciler::UploadReconciler;
use crate::store::{self, Store};
use crate::webhook::WebhookService;

pub struct App {
    pub store: Arc<dyn Store>,
    pub jobs: JobOrchestrator,
    pub uploads: UploadReconciler,
    pub webhooks: WebhookService,
    shutdown: CancellationToken,
}

impl App {
    pub async fn from_config(config: &ScoreConfig) -> Result<Self> {
        let api: Arc<dyn MetrikaApi> =
            Arc::new(MetrikaClient::with_base_url(config.api_base_url.clone())?);
        Self::with_api(config, api).await
    }

    /// Same wiring with an injected provider client.
    pub async fn with_api(config: &ScoreConfig, api: Arc<dyn MetrikaApi>) -> Result<Self> {
        let thresholds = Thresholds::from_model_dir(&config.model_dir)?.overlay(&config.thresholds);
        debug!(?thresholds, model_dir = %config.model_dir.display(), "thresholds resolved");
        let classifier = TierClassifier::new(
            Arc::new(ArtifactDirectory::new(config.model_dir.clone())),
            thresholds,
        );

        let store = store::open(&config.store).await?;
        let shutdown = CancellationToken::new();

        let pipeline = ScoringPipeline::new(
            Arc::clone(&api),
            Arc::new(classifier),
            config.export_poll_interval(),
        );
        let jobs = JobOrchestrator::new(Arc::clone(&store), Arc::new(pipeline));
        let uploads = UploadReconciler::new(
            api,
            Arc::clone(&store),
            config.upload.clone(),
            shutdown.clone(),
        );
        let webhooks = WebhookService::new(
            Arc::clone(&store),
            uploads.clone(),
            &config.webhook_base_url,
        );
        info!(backend = ?config.store.backend, api = %config.api_base_url, "services ready");

        Ok(Self {
            store,
            jobs,
            uploads,
            webhooks,
            shutdown,
        })
    }

    /// Stop every background reconciliation loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
