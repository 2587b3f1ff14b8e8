use std::path::Path;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use metrika_score::app::App;
use metrika_score::config::ScoreConfig;
use metrika_score::formatter::Conversion;
use metrika_score::metrika::CounterAuth;
use metrika_score::state_machine::{JobStatus, RetryConfig, TaskParams, UploadStatus};
use metrika_score::store::{StoreBackend, StoreConfig};

const COUNTER: u64 = 5551234;
const TOKEN: &str = "e2e-token";

const VISITS: &str = "\
ym:s:visitID\tym:s:clientID\tym:s:watchIDs\tym:s:dateTime\tym:s:visitDuration\tym:s:bounce\tym:s:pageViews\tym:s:deviceCategory
1000000000000000001\t1751370000111\t[1000000000000000001001,1000000000000000001002,1000000000000000001003,1000000000000000001004,1000000000000000001005]\t2025-07-01 12:00:00\t600\t0\t8\t1
2000000000000000002\t1751370000222\t[2000000000000000002001]\t2025-07-01 13:00:00\t20\t1\t1\t2
";

const HITS: &str = "\
ym:pv:watchID\tym:pv:dateTime\tym:pv:deviceCategory
1000000000000000001001\t2025-07-01 12:00:00\t1
1000000000000000001002\t2025-07-01 12:00:30\t1
1000000000000000001003\t2025-07-01 12:01:00\t1
1000000000000000001004\t2025-07-01 12:01:30\t1
1000000000000000001005\t2025-07-01 12:02:00\t1
2000000000000000002001\t2025-07-01 13:00:00\t2
";

fn counter_path(rest: &str) -> String {
    format!("/management/v1/counter/{COUNTER}/{rest}")
}

fn log_request(id: u64, status: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "log_request": {
            "request_id": id,
            "status": status,
            "parts": [{"part_number": 0, "size": 64}]
        }
    }))
}

fn uploading(id: u64, status: &str, lines: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "uploading": {"id": id, "status": status, "line_quantity": lines}
    }))
}

async fn mount_exports(server: &MockServer) {
    for (source, id, tsv) in [("visits", 7001, VISITS), ("hits", 7002, HITS)] {
        Mock::given(method("POST"))
            .and(path(counter_path("logrequests")))
            .and(query_param("source", source))
            .and(query_param("date1", "2025-07-01"))
            .and(header("Authorization", format!("OAuth {TOKEN}").as_str()))
            .respond_with(log_request(id, "created"))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(counter_path(&format!("logrequest/{id}"))))
            .respond_with(log_request(id, "processed"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(counter_path(&format!("logrequest/{id}/part/0/download"))))
            .respond_with(ResponseTemplate::new(200).set_body_string(tsv))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(counter_path(&format!("logrequest/{id}/clean"))))
            .respond_with(log_request(id, "cleaned_by_user"))
            .expect(1)
            .mount(server)
            .await;
    }
}

/// The upload is `MATCHED` on the first status check and `PROCESSED` afterwards.
async fn mount_upload(server: &MockServer, id: u64, expected_csv: &str, lines: u64) {
    Mock::given(method("POST"))
        .and(path(counter_path("offline_conversions/upload")))
        .and(body_string_contains(expected_csv))
        .respond_with(uploading(id, "UPLOADED", 0))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(counter_path(&format!("offline_conversions/uploading/{id}"))))
        .respond_with(uploading(id, "MATCHED", 0))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(counter_path(&format!("offline_conversions/uploading/{id}"))))
        .respond_with(uploading(id, "PROCESSED", lines))
        .mount(server)
        .await;
}

/// Mobile visits are always accepted; no desktop model is needed because the
/// only desktop visit passes the rule.
fn write_models(dir: &Path) {
    let mobile = json!({
        "schema_version": 1,
        "name": "mobile-e2e",
        "features": ["duration", "pageViews"],
        "model": {"kind": "logistic", "intercept": 3.0, "coefficients": [0.0, 0.0]}
    });
    std::fs::write(dir.join("level4_mobile.json"), mobile.to_string()).unwrap();
    std::fs::write(dir.join("level4_thresholds.json"), r#"{"mobile": 0.9}"#).unwrap();
}

fn config(server: &MockServer, models: &Path, data: &Path) -> ScoreConfig {
    ScoreConfig {
        api_base_url: server.uri(),
        export_poll_interval_ms: 5,
        model_dir: models.to_path_buf(),
        webhook_base_url: "https://hooks.example.test".into(),
        upload: RetryConfig {
            max_attempts: 20,
            base_delay_ms: 5,
            backoff_coefficient: 1,
            max_delay_ms: 5,
        },
        store: StoreConfig {
            backend: StoreBackend::File,
            path: data.to_path_buf(),
        },
        ..ScoreConfig::default()
    }
}

async fn poll<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..400 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn score_day_then_upload_conversions() {
    let server = MockServer::start().await;
    mount_exports(&server).await;
    mount_upload(
        &server,
        9001,
        "ClientId,Target,DateTime\n1751370000111,4plus,1751371200\n1751370000222,4plus,1751374800\n",
        2,
    )
    .await;
    let models = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_models(models.path());
    let app = App::from_config(&config(&server, models.path(), data.path()))
        .await
        .unwrap();

    let job = app
        .jobs
        .create_job(TaskParams::new("2025-07-01", TOKEN, COUNTER).unwrap())
        .await
        .unwrap();

    // Results are "not ready" until the task is done, never "not found".
    if let Err(e) = app.jobs.job_result(&job.id, 100, 0).await {
        assert!(matches!(e, metrika_score::ScoreError::NotReady { .. }), "{e}");
    }

    let (jobs, task_id) = (&app.jobs, job.id.as_str());
    let done = poll(|| async move {
        let job = jobs.job_status(task_id).await.unwrap();
        job.is_finished().then_some(job)
    })
    .await;
    assert_eq!(done.status, JobStatus::Done, "{:?}", done.error);
    assert_eq!(done.message, "Found 2 tier-4+ visits");
    assert!(done.finished_at.is_some());

    let page = app.jobs.job_result(&job.id, 100, 0).await.unwrap();
    assert_eq!(page.pagination.total, 2);
    assert!(!page.pagination.has_more);
    let clients: Vec<_> = page.results.iter().map(|r| r.client_id.as_str()).collect();
    assert_eq!(clients, ["1751370000111", "1751370000222"]);

    let upload = app
        .uploads
        .submit_bulk(&job.id, "4plus", CounterAuth::new(COUNTER, TOKEN))
        .await
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Uploaded);
    assert_eq!(upload.total_conversions, 2);

    let (uploads, upload_id) = (&app.uploads, upload.id.as_str());
    let settled = poll(|| async move {
        let report = uploads.upload_status(upload_id).await.unwrap();
        matches!(report.status, UploadStatus::Completed | UploadStatus::Error).then_some(report)
    })
    .await;
    assert_eq!(settled.status, UploadStatus::Completed);
    assert_eq!(settled.processed_conversions, 2);
    assert!(settled.errors.is_none());

    let listed = app.uploads.uploads_for_task(&job.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, upload.id);

    // Records live on disk under the configured store path.
    assert!(data.path().join("jobs").join(format!("{}.json", job.id)).is_file());
    app.shutdown();
}

#[tokio::test]
async fn webhook_batch_is_delivered_and_reconciled() {
    let server = MockServer::start().await;
    mount_upload(&server, 9002, "ClientId,Target,DateTime\nc-1,lead,1751371200\n", 1).await;
    let models = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let app = App::from_config(&config(&server, models.path(), data.path()))
        .await
        .unwrap();

    let registration = app
        .webhooks
        .register("crm", COUNTER, TOKEN)
        .await
        .unwrap();
    assert_eq!(
        registration.url,
        format!(
            "https://hooks.example.test/webhook/offline-conversions/{}",
            registration.webhook_id
        )
    );

    let conversions = vec![
        Conversion {
            client_id: Some("c-1".into()),
            target: "lead".into(),
            date_time: "2025-07-01T12:00:00Z".into(),
            ..Conversion::default()
        },
        Conversion {
            yclid: Some("y-1".into()),
            target: "lead".into(),
            date_time: "2025-07-01T12:00:00Z".into(),
            ..Conversion::default()
        },
    ];
    let accepted = app
        .webhooks
        .submit(&registration.webhook_id, Some(&registration.secret), conversions)
        .await
        .unwrap();
    assert_eq!(accepted.accepted, 2);
    assert_eq!(accepted.status, UploadStatus::Pending);

    let webhooks = &app.webhooks;
    let (webhook_id, secret, batch_id) = (
        registration.webhook_id.as_str(),
        registration.secret.as_str(),
        accepted.batch_id.as_str(),
    );
    let settled = poll(|| async move {
        let report = webhooks
            .batch_status(webhook_id, Some(secret), batch_id)
            .await
            .unwrap();
        (report.status == UploadStatus::Completed).then_some(report)
    })
    .await;
    assert_eq!(settled.total_conversions, 2);
    assert_eq!(settled.processed_conversions, 1);

    assert!(
        app.webhooks
            .batch_status(&registration.webhook_id, Some("wrong"), &accepted.batch_id)
            .await
            .is_err()
    );
    app.shutdown();
}
