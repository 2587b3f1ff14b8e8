//! Shared fixtures: one scoring day served by a wiremock Metrika and a model directory.

use std::path::Path;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const COUNTER: u64 = 92342184;
pub const TOKEN: &str = "test-token";
pub const DATE: &str = "2025-07-01";

pub const VISITS_ID: u64 = 101;
pub const HITS_ID: u64 = 102;

/// Three visits: 111 passes the rule (desktop), 222 is a short mobile visit
/// the mobile model accepts, 333 is a short desktop visit the desktop model rejects.
pub const VISITS_TSV: &str = "\
ym:s:visitID\tym:s:clientID\tym:s:watchIDs\tym:s:dateTime\tym:s:visitDuration\tym:s:bounce\tym:s:pageViews\tym:s:deviceCategory
1000000000000000001\t111\t[1000000000000000001001,1000000000000000001002,1000000000000000001003,1000000000000000001004,1000000000000000001005,1000000000000000001006]\t2025-07-01 12:00:00\t300\t0\t6\t1
2000000000000000002\t222\t[2000000000000000002001]\t2025-07-01 13:00:00\t30\t1\t1\t2
3000000000000000003\t333\t[3000000000000000003001,3000000000000000003002]\t2025-07-01 14:00:00\t40\t0\t2\t1
";

pub const HITS_TSV: &str = "\
ym:pv:watchID\tym:pv:dateTime\tym:pv:deviceCategory
1000000000000000001001\t2025-07-01 12:00:00\t1
1000000000000000001002\t2025-07-01 12:00:20\t1
1000000000000000001003\t2025-07-01 12:00:40\t1
1000000000000000001004\t2025-07-01 12:01:00\t1
1000000000000000001005\t2025-07-01 12:01:20\t1
1000000000000000001006\t2025-07-01 12:01:40\t1
2000000000000000002001\t2025-07-01 13:00:00\t2
3000000000000000003001\t2025-07-01 14:00:00\t1
3000000000000000003002\t2025-07-01 14:00:10\t1
";

pub fn counter_path(rest: &str) -> String {
    format!("/management/v1/counter/{COUNTER}/{rest}")
}

fn logistic(intercept: f64) -> serde_json::Value {
    json!({
        "schema_version": 1,
        "name": "fixture",
        "features": ["slots"],
        "model": {"kind": "logistic", "intercept": intercept, "coefficients": [0.0]}
    })
}

/// Mobile model always says ~0.88, desktop model ~0.007.
pub fn write_models(dir: &Path) {
    std::fs::write(dir.join("level4_mobile.json"), logistic(2.0).to_string()).unwrap();
    std::fs::write(dir.join("level4_desktop.json"), logistic(-5.0).to_string()).unwrap();
}

fn log_request(id: u64, status: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "log_request": {
            "request_id": id,
            "status": status,
            "parts": [{"part_number": 0, "size": 100}]
        }
    }))
}

/// Mount both exports. Each reports `processing` once before `processed`,
/// and each must be cleaned exactly once.
pub async fn mount_exports(server: &MockServer) {
    for (source, id, tsv) in [("visits", VISITS_ID, VISITS_TSV), ("hits", HITS_ID, HITS_TSV)] {
        Mock::given(method("POST"))
            .and(path(counter_path("logrequests")))
            .and(query_param("source", source))
            .respond_with(log_request(id, "created"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(counter_path(&format!("logrequest/{id}"))))
            .respond_with(log_request(id, "processing"))
            .up_to_n_times(1)
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

/// Upload accepted as `UPLOADED`, then reported `PROCESSED` with `lines` rows.
pub async fn mount_upload(server: &MockServer, provider_id: u64, lines: u64) {
    Mock::given(method("POST"))
        .and(path(counter_path("offline_conversions/upload")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploading": {"id": provider_id, "status": "UPLOADED", "line_quantity": 0}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(counter_path(&format!(
            "offline_conversions/uploading/{provider_id}"
        ))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploading": {"id": provider_id, "status": "PROCESSED", "line_quantity": lines}
        })))
        .mount(server)
        .await;
}
