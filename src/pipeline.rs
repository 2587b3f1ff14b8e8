//! One day of scoring: export raw logs from Metrika, derive features,
//! classify, and keep the tier-4+ visits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::TierClassifier;
use crate::error::{Result, ScoreError};
use crate::features::FeatureExtractor;
use crate::metrika::{CounterAuth, LogRequestInfo, LogSource, LogTable, MetrikaApi, MetrikaError};
use crate::state_machine::TaskParams;

pub const DEFAULT_EXPORT_POLL_INTERVAL: Duration = Duration::from_secs(8);

/// A tier-4+ visit as stored and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitResult {
    pub visit_id: String,
    pub client_id: String,
    pub date_time: String,
    pub visit_duration: i64,
}

/// Receives progress checkpoints while the pipeline runs.
#[async_trait]
pub trait PipelineObserver: Send + Sync {
    async fn checkpoint(&self, progress: u8, message: &str);
}

pub struct NoopObserver;

#[async_trait]
impl PipelineObserver for NoopObserver {
    async fn checkpoint(&self, _progress: u8, _message: &str) {}
}

/// What the provider's export status means for the poll loop.
enum ExportState {
    Ready,
    Waiting,
    Failed,
}

fn export_state(status: &str) -> ExportState {
    match status {
        "processed" => ExportState::Ready,
        "created" | "processing" | "processed_with_errors" | "awaiting_retry" => {
            ExportState::Waiting
        }
        _ => ExportState::Failed,
    }
}

pub struct ScoringPipeline {
    api: Arc<dyn MetrikaApi>,
    classifier: Arc<TierClassifier>,
    poll_interval: Duration,
}

impl ScoringPipeline {
    pub fn new(
        api: Arc<dyn MetrikaApi>,
        classifier: Arc<TierClassifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            classifier,
            poll_interval,
        }
    }

    /// Score one (counter, date). Any failure aborts the run; exports created
    /// on the provider side are cleaned either way.
    pub async fn run(
        &self,
        params: &TaskParams,
        observer: &dyn PipelineObserver,
    ) -> Result<Vec<VisitResult>> {
        let auth = CounterAuth::new(params.counter, params.token.clone());
        let date = params.date.as_str();

        let (visits_req, hits_req) = tokio::join!(
            self.api.create_log_request(&auth, LogSource::Visits, date),
            self.api.create_log_request(&auth, LogSource::Hits, date),
        );
        let created: Vec<u64> = [visits_req.as_ref().ok(), hits_req.as_ref().ok()]
            .into_iter()
            .flatten()
            .map(|info| info.request_id)
            .collect();
        let (visits_req, hits_req) = match (visits_req, hits_req) {
            (Ok(v), Ok(h)) => (v, h),
            (Err(e), _) | (_, Err(e)) => {
                self.clean_after_failure(&auth, &created).await;
                return Err(e.into());
            }
        };
        info!(
            counter = auth.counter,
            date,
            visits_request = visits_req.request_id,
            hits_request = hits_req.request_id,
            "log exports requested"
        );

        let outcome = self
            .score(&auth, visits_req.request_id, hits_req.request_id, observer)
            .await;

        match outcome {
            Ok(results) => {
                for id in created {
                    self.api.clean_log_request(&auth, id).await?;
                    debug!(request_id = id, "log export cleaned");
                }
                Ok(results)
            }
            Err(e) => {
                self.clean_after_failure(&auth, &created).await;
                Err(e)
            }
        }
    }

    async fn score(
        &self,
        auth: &CounterAuth,
        visits_id: u64,
        hits_id: u64,
        observer: &dyn PipelineObserver,
    ) -> Result<Vec<VisitResult>> {
        observer
            .checkpoint(30, "Waiting for Metrika to prepare logs")
            .await;
        let (visits_info, hits_info) = tokio::try_join!(
            self.wait_processed(auth, LogSource::Visits, visits_id),
            self.wait_processed(auth, LogSource::Hits, hits_id),
        )?;

        observer.checkpoint(60, "Downloading logs").await;
        let (visits, hits) = tokio::try_join!(
            self.download(auth, LogSource::Visits, &visits_info),
            self.download(auth, LogSource::Hits, &hits_info),
        )?;
        info!(visits = visits.len(), hits = hits.len(), "logs downloaded");

        observer.checkpoint(80, "Scoring visits").await;
        let extractor = FeatureExtractor::from_hits(&hits)?;
        let features = extractor.extract(&visits)?;
        let labels = self.classifier.classify(&features)?;

        Ok(features
            .into_iter()
            .zip(labels)
            .filter(|(_, label)| label.tier4_plus)
            .map(|(visit, _)| VisitResult {
                visit_id: visit.visit_id,
                client_id: visit.client_id,
                date_time: visit.date_time,
                visit_duration: visit.features.duration,
            })
            .collect())
    }

    async fn wait_processed(
        &self,
        auth: &CounterAuth,
        source: LogSource,
        request_id: u64,
    ) -> Result<LogRequestInfo> {
        loop {
            let info = self.api.log_request(auth, request_id).await?;
            match export_state(&info.status) {
                ExportState::Ready => return Ok(info),
                ExportState::Waiting => {
                    debug!(%source, request_id, status = %info.status, "log export not ready");
                    tokio::time::sleep(self.poll_interval).await;
                }
                ExportState::Failed => {
                    return Err(MetrikaError::ExportFailed {
                        request_id,
                        status: info.status,
                    }
                    .into());
                }
            }
        }
    }

    /// Every listed part, concatenated. Part 0 when none are listed.
    async fn download(
        &self,
        auth: &CounterAuth,
        source: LogSource,
        info: &LogRequestInfo,
    ) -> Result<LogTable> {
        let mut parts: Vec<u32> = info.parts.iter().map(|p| p.part_number).collect();
        if parts.is_empty() {
            parts.push(0);
        }
        parts.sort_unstable();

        let mut table = LogTable::default();
        for part in parts {
            let chunk = self
                .api
                .download_part(auth, info.request_id, part)
                .await?;
            debug!(%source, request_id = info.request_id, part, rows = chunk.len(), "downloaded part");
            if !table.append(chunk) {
                return Err(ScoreError::DataIntegrity(format!(
                    "{source} export part {part} has a different header"
                )));
            }
        }
        Ok(table)
    }

    async fn clean_after_failure(&self, auth: &CounterAuth, request_ids: &[u64]) {
        for &id in request_ids {
            if let Err(e) = self.api.clean_log_request(auth, id).await {
                warn!(request_id = id, error = %e, "failed to clean log export");
            }
        }
    }
}
