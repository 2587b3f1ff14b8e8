use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Lifecycle, TransitionError};

/// Upload lifecycle shared by conversion uploads and webhook batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Processing,
    Completed,
    Error,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl Lifecycle for UploadStatus {
    const KIND: &'static str = "upload";

    fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }

    fn allows(self, next: Self) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Pending, Uploaded) => true,
            (Uploaded, Uploaded | Processing | Completed) => true,
            (Processing, Processing | Completed) => true,
            _ => false,
        }
    }
}

/// Maps a provider upload status onto ours. Unknown values are `Processing`.
pub fn map_provider_status(raw: &str) -> UploadStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "PREPARED" | "UPLOADED" => UploadStatus::Uploaded,
        "EXPORTED" | "MATCHED" => UploadStatus::Processing,
        "PROCESSED" => UploadStatus::Completed,
        "LINKAGE_FAILURE" => UploadStatus::Error,
        _ => UploadStatus::Processing,
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_backoff_coefficient() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    300_000
}

/// Bounded exponential backoff for status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * coefficient^(attempt - 1), capped at max_delay_ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_coefficient).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Progress of the background poll loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileState {
    pub attempts_made: u32,
    pub remaining_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ReconcileState {
    pub fn scheduled(&mut self, max_attempts: u32, first_at: DateTime<Utc>) {
        self.attempts_made = 0;
        self.remaining_attempts = max_attempts;
        self.next_attempt_at = Some(first_at);
    }

    /// Counts one attempt; `next_at` is `None` when polling stops.
    pub fn attempted(&mut self, next_at: Option<DateTime<Utc>>) {
        self.attempts_made += 1;
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
        self.next_attempt_at = next_at;
    }

    pub fn stopped(&mut self) {
        self.next_attempt_at = None;
    }
}

/// Status, counters and reconciliation bookkeeping of one submitted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    pub status: UploadStatus,
    /// Handle assigned by the provider on submission.
    pub provider_upload_id: Option<String>,
    pub total_conversions: usize,
    pub processed_conversions: u64,
    pub errors: Option<Vec<String>>,
    #[serde(default)]
    pub reconcile: ReconcileState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadState {
    pub fn new(total_conversions: usize) -> Self {
        let now = Utc::now();
        Self {
            status: UploadStatus::Pending,
            provider_upload_id: None,
            total_conversions,
            processed_conversions: 0,
            errors: None,
            reconcile: ReconcileState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_uploaded(&mut self, provider_upload_id: impl Into<String>) -> Result<(), TransitionError> {
        self.status.check(UploadStatus::Uploaded)?;
        self.status = UploadStatus::Uploaded;
        self.provider_upload_id = Some(provider_upload_id.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_error(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.status.check(UploadStatus::Error)?;
        self.status = UploadStatus::Error;
        self.errors.get_or_insert_with(Vec::new).push(message.into());
        self.reconcile.stopped();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Applies a provider status report. On an illegal transition nothing changes.
    pub fn apply_provider_status(
        &mut self,
        raw_status: &str,
        line_quantity: Option<u64>,
    ) -> Result<UploadStatus, TransitionError> {
        let next = map_provider_status(raw_status);
        self.status.check(next)?;
        self.status = next;
        if let Some(lines) = line_quantity {
            self.processed_conversions = lines;
        }
        if next == UploadStatus::Error {
            self.errors
                .get_or_insert_with(Vec::new)
                .push(format!("Metrika status: {raw_status}"));
        }
        if next.is_terminal() {
            self.reconcile.stopped();
        }
        self.updated_at = Utc::now();
        Ok(next)
    }
}

/// One push of conversions to the provider, bulk (from a task) or single.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionUpload {
    pub id: String,
    /// Absent for single ad-hoc conversions.
    pub task_id: Option<String>,
    pub counter: u64,
    /// Kept so status can be refreshed on demand.
    pub token: String,
    pub target: String,
    #[serde(flatten)]
    pub state: UploadState,
}

impl ConversionUpload {
    pub fn new(
        task_id: Option<String>,
        counter: u64,
        token: impl Into<String>,
        target: impl Into<String>,
        total_conversions: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            counter,
            token: token.into(),
            target: target.into(),
            state: UploadState::new(total_conversions),
        }
    }

    pub fn report(&self) -> UploadReport {
        UploadReport::new(&self.id, self.task_id.clone(), &self.state)
    }
}

/// Conversions received through one webhook submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookBatch {
    pub id: String,
    pub webhook_id: String,
    #[serde(flatten)]
    pub state: UploadState,
}

impl WebhookBatch {
    pub fn new(webhook_id: impl Into<String>, total_conversions: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            webhook_id: webhook_id.into(),
            state: UploadState::new(total_conversions),
        }
    }

    pub fn report(&self) -> UploadReport {
        UploadReport::new(&self.id, None, &self.state)
    }
}

/// Caller-facing status of an upload or webhook batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: UploadStatus,
    pub total_conversions: usize,
    pub processed_conversions: u64,
    pub errors: Option<Vec<String>>,
    pub attempts_made: u32,
    pub remaining_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadReport {
    fn new(id: &str, task_id: Option<String>, state: &UploadState) -> Self {
        Self {
            id: id.to_string(),
            task_id,
            status: state.status,
            total_conversions: state.total_conversions,
            processed_conversions: state.processed_conversions,
            errors: state.errors.clone(),
            attempts_made: state.reconcile.attempts_made,
            remaining_attempts: state.reconcile.remaining_attempts,
            next_attempt_at: state.reconcile.next_attempt_at,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploaded() -> UploadState {
        let mut state = UploadState::new(3);
        state.mark_uploaded("77").unwrap();
        state
    }

    #[test]
    fn status_table() {
        assert_eq!(map_provider_status("PREPARED"), UploadStatus::Uploaded);
        assert_eq!(map_provider_status("UPLOADED"), UploadStatus::Uploaded);
        assert_eq!(map_provider_status("EXPORTED"), UploadStatus::Processing);
        assert_eq!(map_provider_status("MATCHED"), UploadStatus::Processing);
        assert_eq!(map_provider_status("PROCESSED"), UploadStatus::Completed);
        assert_eq!(map_provider_status("LINKAGE_FAILURE"), UploadStatus::Error);
        assert_eq!(map_provider_status("processed"), UploadStatus::Completed);
    }

    #[test]
    fn unknown_provider_status_is_processing() {
        assert_eq!(map_provider_status("SOMETHING_NEW"), UploadStatus::Processing);
        assert_eq!(map_provider_status(""), UploadStatus::Processing);
    }

    #[test]
    fn happy_path() {
        let mut state = uploaded();
        assert_eq!(state.provider_upload_id.as_deref(), Some("77"));
        assert_eq!(state.apply_provider_status("MATCHED", None).unwrap(), UploadStatus::Processing);
        assert_eq!(state.apply_provider_status("PROCESSED", Some(3)).unwrap(), UploadStatus::Completed);
        assert_eq!(state.processed_conversions, 3);
        assert!(state.is_settled());
        assert!(state.errors.is_none());
    }

    #[test]
    fn linkage_failure_records_raw_status() {
        let mut state = uploaded();
        state.apply_provider_status("LINKAGE_FAILURE", Some(0)).unwrap();
        assert_eq!(state.status, UploadStatus::Error);
        assert_eq!(
            state.errors.as_deref(),
            Some(&["Metrika status: LINKAGE_FAILURE".to_string()][..])
        );
    }

    #[test]
    fn regression_is_rejected_without_change() {
        let mut state = uploaded();
        state.apply_provider_status("EXPORTED", None).unwrap();
        let before = state.clone();
        let err = state.apply_provider_status("PREPARED", Some(9)).unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn terminal_is_final() {
        let mut state = uploaded();
        state.apply_provider_status("PROCESSED", Some(3)).unwrap();
        assert!(matches!(
            state.mark_error("late"),
            Err(TransitionError::Terminal { .. })
        ));
        assert_eq!(state.status, UploadStatus::Completed);
    }

    #[test]
    fn error_reachable_from_pending() {
        let mut state = UploadState::new(1);
        state.mark_error("upload rejected").unwrap();
        assert_eq!(state.status, UploadStatus::Error);
        assert_eq!(state.errors.unwrap(), vec!["upload rejected".to_string()]);
    }

    #[test]
    fn pending_cannot_skip_submission() {
        let mut state = UploadState::new(1);
        assert!(state.apply_provider_status("PROCESSED", None).is_err());
        assert_eq!(state.status, UploadStatus::Pending);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1000,
            backoff_coefficient: 2,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(5000));
    }

    #[test]
    fn coefficient_one_is_fixed_delay() {
        let policy = RetryConfig {
            backoff_coefficient: 1,
            ..RetryConfig::default()
        };
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(30_000));
    }

    #[test]
    fn reconcile_bookkeeping() {
        let mut r = ReconcileState::default();
        let now = Utc::now();
        r.scheduled(3, now);
        r.attempted(Some(now));
        assert_eq!((r.attempts_made, r.remaining_attempts), (1, 2));
        r.attempted(None);
        assert_eq!((r.attempts_made, r.remaining_attempts), (2, 1));
        assert!(r.next_attempt_at.is_none());
    }

    #[test]
    fn upload_serializes_flat() {
        let upload = ConversionUpload::new(Some("t1".into()), 42, "tok", "4plus", 5);
        let value = serde_json::to_value(&upload).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["total_conversions"], 5);
        let back: ConversionUpload = serde_json::from_value(value).unwrap();
        assert_eq!(back, upload);
    }

    #[test]
    fn report_reflects_state() {
        let mut batch = WebhookBatch::new("wh", 2);
        batch.state.mark_uploaded("1").unwrap();
        let report = batch.report();
        assert_eq!(report.id, batch.id);
        assert_eq!(report.status, UploadStatus::Uploaded);
        assert_eq!(report.total_conversions, 2);
        assert!(report.task_id.is_none());
    }
}
