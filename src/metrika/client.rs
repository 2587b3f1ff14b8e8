use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use tracing::debug;

use super::error::MetrikaError;
use super::types::{
    CounterAuth, LogRequestEnvelope, LogRequestInfo, LogSource, LogTable, UploadingEnvelope,
    UploadingInfo,
};

pub const API_URL: &str = "https://api-metrika.yandex.net";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Operations the scoring pipeline and the upload reconciler need from Metrika.
///
/// Implemented by [`MetrikaClient`] for real traffic and by in-memory fakes in tests.
#[async_trait]
pub trait MetrikaApi: Send + Sync {
    /// Ask Metrika to start exporting one day of raw logs for `source`.
    async fn create_log_request(
        &self,
        auth: &CounterAuth,
        source: LogSource,
        date: &str,
    ) -> Result<LogRequestInfo, MetrikaError>;

    /// Current state of an export, including its parts once processed.
    async fn log_request(
        &self,
        auth: &CounterAuth,
        request_id: u64,
    ) -> Result<LogRequestInfo, MetrikaError>;

    async fn download_part(
        &self,
        auth: &CounterAuth,
        request_id: u64,
        part: u32,
    ) -> Result<LogTable, MetrikaError>;

    /// Release the provider-side export once its data is no longer needed.
    async fn clean_log_request(&self, auth: &CounterAuth, request_id: u64)
    -> Result<(), MetrikaError>;

    /// Submit an offline conversions payload, returning the provider handle.
    async fn upload_conversions(
        &self,
        auth: &CounterAuth,
        csv: String,
    ) -> Result<UploadingInfo, MetrikaError>;

    async fn upload_status(
        &self,
        auth: &CounterAuth,
        upload_id: &str,
    ) -> Result<UploadingInfo, MetrikaError>;
}

pub struct MetrikaClient {
    client: Client,
    base_url: String,
}

impl MetrikaClient {
    pub fn new() -> Result<Self, MetrikaError> {
        Self::with_base_url(API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(base_url: String) -> Result<Self, MetrikaError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("metrika-score/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn counter_url(&self, auth: &CounterAuth, path: &str) -> String {
        format!(
            "{}/management/v1/counter/{}/{}",
            self.base_url, auth.counter, path
        )
    }

    fn authorization(auth: &CounterAuth) -> String {
        format!("OAuth {}", auth.token)
    }

    async fn log_request_json(response: Response) -> Result<LogRequestInfo, MetrikaError> {
        let response = ensure_success(response).await?;
        let body = response
            .json::<LogRequestEnvelope>()
            .await
            .map_err(|e| MetrikaError::ParseError(e.to_string()))?;
        Ok(body.log_request)
    }

    async fn uploading_json(response: Response) -> Result<UploadingInfo, MetrikaError> {
        let response = ensure_success(response).await?;
        let body = response
            .json::<UploadingEnvelope>()
            .await
            .map_err(|e| MetrikaError::ParseError(e.to_string()))?;
        Ok(body.uploading)
    }
}

#[async_trait]
impl MetrikaApi for MetrikaClient {
    async fn create_log_request(
        &self,
        auth: &CounterAuth,
        source: LogSource,
        date: &str,
    ) -> Result<LogRequestInfo, MetrikaError> {
        let fields = source.fields().join(",");
        debug!(counter = auth.counter, %source, date, "creating log request");
        let response = self
            .client
            .post(self.counter_url(auth, "logrequests"))
            .header("Authorization", Self::authorization(auth))
            .query(&[
                ("date1", date),
                ("date2", date),
                ("fields", fields.as_str()),
                ("source", source.as_str()),
            ])
            .send()
            .await?;
        Self::log_request_json(response).await
    }

    async fn log_request(
        &self,
        auth: &CounterAuth,
        request_id: u64,
    ) -> Result<LogRequestInfo, MetrikaError> {
        let response = self
            .client
            .get(self.counter_url(auth, &format!("logrequest/{request_id}")))
            .header("Authorization", Self::authorization(auth))
            .send()
            .await?;
        Self::log_request_json(response).await
    }

    async fn download_part(
        &self,
        auth: &CounterAuth,
        request_id: u64,
        part: u32,
    ) -> Result<LogTable, MetrikaError> {
        let response = self
            .client
            .get(self.counter_url(
                auth,
                &format!("logrequest/{request_id}/part/{part}/download"),
            ))
            .header("Authorization", Self::authorization(auth))
            .send()
            .await?;
        let bytes = ensure_success(response).await?.bytes().await?;
        parse_tsv(&decode_body(&bytes)?)
    }

    async fn clean_log_request(
        &self,
        auth: &CounterAuth,
        request_id: u64,
    ) -> Result<(), MetrikaError> {
        let response = self
            .client
            .post(self.counter_url(auth, &format!("logrequest/{request_id}/clean")))
            .header("Authorization", Self::authorization(auth))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn upload_conversions(
        &self,
        auth: &CounterAuth,
        csv: String,
    ) -> Result<UploadingInfo, MetrikaError> {
        let part = Part::text(csv)
            .file_name("conversions.csv")
            .mime_str("text/csv")?;
        let form = Form::new().part("file", part);
        debug!(counter = auth.counter, "uploading offline conversions");
        let response = self
            .client
            .post(self.counter_url(auth, "offline_conversions/upload"))
            .header("Authorization", Self::authorization(auth))
            .multipart(form)
            .send()
            .await?;
        Self::uploading_json(response).await
    }

    async fn upload_status(
        &self,
        auth: &CounterAuth,
        upload_id: &str,
    ) -> Result<UploadingInfo, MetrikaError> {
        let response = self
            .client
            .get(self.counter_url(
                auth,
                &format!("offline_conversions/uploading/{upload_id}"),
            ))
            .header("Authorization", Self::authorization(auth))
            .send()
            .await?;
        Self::uploading_json(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, MetrikaError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(MetrikaError::ApiError {
        status: status.as_u16(),
        message,
    })
}

/// Downloads may arrive gzip-compressed or as plain TSV.
fn decode_body(bytes: &[u8]) -> Result<String, MetrikaError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|e| MetrikaError::ParseError(format!("gzip: {e}")))?;
        Ok(text)
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MetrikaError::ParseError(format!("utf-8: {e}")))
    }
}

/// Parse a tab-separated export with a header row.
pub fn parse_tsv(text: &str) -> Result<LogTable, MetrikaError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let columns = reader
        .headers()
        .map_err(|e| MetrikaError::ParseError(format!("tsv header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| MetrikaError::ParseError(format!("tsv row: {e}")))?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(LogTable { columns, rows })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn auth() -> CounterAuth {
        CounterAuth::new(92342184, "test-token")
    }

    #[test]
    fn parse_tsv_reads_header_and_rows() {
        let table = parse_tsv("ym:pv:watchID\tym:pv:dateTime\n1\t2025-07-01 10:00:00\n").unwrap();
        assert_eq!(table.columns, vec!["ym:pv:watchID", "ym:pv:dateTime"]);
        assert_eq!(table.rows, vec![vec!["1", "2025-07-01 10:00:00"]]);
    }

    #[test]
    fn parse_tsv_keeps_brackets_and_quotes_verbatim() {
        let table = parse_tsv("ym:s:watchIDs\tname\n[1,2,3]\t\"quoted\n").unwrap();
        assert_eq!(table.rows[0][0], "[1,2,3]");
        assert_eq!(table.rows[0][1], "\"quoted");
    }

    #[test]
    fn parse_tsv_rejects_ragged_rows() {
        let result = parse_tsv("a\tb\n1\n");
        assert!(matches!(result, Err(MetrikaError::ParseError(_))));
    }

    #[test]
    fn decode_body_handles_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"a\tb\n1\t2\n").unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decode_body(&gz).unwrap(), "a\tb\n1\t2\n");
        assert_eq!(decode_body(b"plain").unwrap(), "plain");
    }

    #[tokio::test]
    async fn create_log_request_sends_fields_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/management/v1/counter/92342184/logrequests"))
            .and(header("Authorization", "OAuth test-token"))
            .and(query_param("source", "hits"))
            .and(query_param("date1", "2025-07-01"))
            .and(query_param("date2", "2025-07-01"))
            .and(query_param(
                "fields",
                "ym:pv:watchID,ym:pv:dateTime,ym:pv:deviceCategory",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "log_request": {"request_id": 11, "status": "created"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = MetrikaClient::with_base_url(server.uri()).unwrap();
        let info = client
            .create_log_request(&auth(), LogSource::Hits, "2025-07-01")
            .await
            .unwrap();
        assert_eq!(info.request_id, 11);
        assert_eq!(info.status, "created");
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/management/v1/counter/92342184/logrequest/5"))
            .respond_with(ResponseTemplate::new(403).set_body_string("access denied"))
            .mount(&server)
            .await;

        let client = MetrikaClient::with_base_url(server.uri()).unwrap();
        let err = client.log_request(&auth(), 5).await.unwrap_err();
        match err {
            MetrikaError::ApiError { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "access denied");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_part_decodes_gzip_tsv() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"ym:pv:watchID\tym:pv:dateTime\tym:pv:deviceCategory\n42\t2025-07-01 00:00:01\t1\n")
            .unwrap();
        let gz = encoder.finish().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/management/v1/counter/92342184/logrequest/9/part/0/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gz))
            .mount(&server)
            .await;

        let client = MetrikaClient::with_base_url(server.uri()).unwrap();
        let table = client.download_part(&auth(), 9, 0).await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0][0], "42");
    }

    #[tokio::test]
    async fn upload_conversions_returns_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/management/v1/counter/92342184/offline_conversions/upload",
            ))
            .and(header("Authorization", "OAuth test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uploading": {"id": 555, "status": "UPLOADED", "line_quantity": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = MetrikaClient::with_base_url(server.uri()).unwrap();
        let info = client
            .upload_conversions(&auth(), "ClientId,Target,DateTime\nabc,4plus,1751371200\n".into())
            .await
            .unwrap();
        assert_eq!(info.id, "555");
        assert_eq!(info.status, "UPLOADED");
        assert_eq!(info.line_quantity, Some(2));
    }

    #[tokio::test]
    async fn upload_status_parses_line_quantity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/management/v1/counter/92342184/offline_conversions/uploading/555",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uploading": {"id": 555, "status": "PROCESSED", "line_quantity": 2}
            })))
            .mount(&server)
            .await;

        let client = MetrikaClient::with_base_url(format!("{}/", server.uri())).unwrap();
        let info = client.upload_status(&auth(), "555").await.unwrap();
        assert_eq!(info.status, "PROCESSED");
        assert_eq!(info.line_quantity, Some(2));
    }
}
