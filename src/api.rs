use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::FetchError;
use crate::job::{JobReport, JobStatus, ProgressPayload};
use crate::watch::ProgressSource;

/// Every backend JSON response is wrapped in this envelope; `code == 0` is success.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CancelAck {
    #[serde(default)]
    message: String,
}

/// A generated survey document.
#[derive(Debug, Clone)]
pub struct SurveyFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurveyHistory {
    pub total: u64,
    #[serde(default)]
    pub records: Vec<SurveyRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurveyRecord {
    pub id: String,
    #[serde(default)]
    pub survey_title: Option<String>,
    pub status: JobStatus,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl SurveyRecord {
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created_at.and_then(DateTime::from_timestamp_millis)
    }
}

pub struct SurveyApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl SurveyApiClient {
    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("SURVEY_API_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:9380/v1/paper_search".to_string());
        let token = dotenv::var("SURVEY_API_TOKEN").ok().filter(|k| !k.is_empty());
        let timeout_secs = dotenv::var("SURVEY_API_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30);

        Self::new(&base_url, token, Duration::from_secs(timeout_secs))
    }

    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn survey_endpoint(&self, survey_id: &str, action: Option<&str>) -> String {
        let id = urlencoding::encode(survey_id);
        match action {
            Some(action) => self.endpoint(&format!("paper_survey/{}/{}", id, action)),
            None => self.endpoint(&format!("paper_survey/{}", id)),
        }
    }

    async fn send(&self, req: RequestBuilder, url: &str) -> Result<reqwest::Response, FetchError> {
        let req = match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        };

        let resp = req.send().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        url: &str,
    ) -> Result<T, FetchError> {
        let resp = self.send(req, url).await?;
        let text = resp.text().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        decode_envelope(&text)
    }

    /// Read the current status of a survey job.
    pub async fn progress(&self, survey_id: &str) -> Result<JobReport, FetchError> {
        let url = self.survey_endpoint(survey_id, Some("progress"));
        let payload: ProgressPayload = self.send_json(self.client.get(&url), &url).await?;
        debug!(survey_id, status = %payload.status, progress = payload.progress, "Progress fetched");
        JobReport::try_from(payload)
    }

    /// Ask the backend to cancel a pending or processing job.
    pub async fn cancel(&self, survey_id: &str) -> Result<String, FetchError> {
        let url = self.survey_endpoint(survey_id, Some("cancel"));
        let ack: CancelAck = self.send_json(self.client.post(&url), &url).await?;
        Ok(ack.message)
    }

    /// Fetch the generated survey document.
    pub async fn download(&self, survey_id: &str, format: &str) -> Result<SurveyFile, FetchError> {
        let url = self.endpoint("paper_survey_doc");
        let body = serde_json::json!({ "survey_id": survey_id, "format": format });
        let resp = self.send(self.client.post(&url).json(&body), &url).await?;

        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let filename = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("survey-{}.{}", survey_id, format));

        let bytes = resp.bytes().await.map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;

        // Errors come back as a JSON envelope instead of a document
        if is_json {
            let text = String::from_utf8_lossy(&bytes);
            decode_envelope::<serde_json::Value>(&text)?;
            return Err(FetchError::malformed("expected a document, got JSON"));
        }
        if bytes.is_empty() {
            return Err(FetchError::malformed("document is empty"));
        }

        debug!(survey_id, filename = %filename, size = bytes.len(), "Survey document downloaded");
        Ok(SurveyFile {
            filename,
            bytes: bytes.to_vec(),
        })
    }

    pub async fn survey_history(
        &self,
        page: u32,
        page_size: u32,
        keyword: Option<&str>,
    ) -> Result<SurveyHistory, FetchError> {
        let url = self.endpoint("survey_history");
        let query = [
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
            ("keyword", keyword.unwrap_or_default().to_string()),
        ];
        self.send_json(self.client.get(&url).query(&query), &url)
            .await
    }

    /// Delete a survey record from the backend history.
    pub async fn delete_record(&self, survey_id: &str) -> Result<(), FetchError> {
        let id = urlencoding::encode(survey_id);
        let url = self.endpoint(&format!("paper_survey_record/{}", id));
        let deleted: bool = self.send_json(self.client.delete(&url), &url).await?;
        if !deleted {
            return Err(FetchError::malformed("backend did not confirm the deletion"));
        }
        debug!(survey_id, "Survey record deleted");
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for SurveyApiClient {
    async fn fetch_progress(&self, job_id: &str) -> Result<JobReport, FetchError> {
        self.progress(job_id).await
    }
}

fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<T, FetchError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| FetchError::malformed(format!("invalid response envelope: {}", e)))?;

    if envelope.code != 0 {
        return Err(FetchError::Api {
            code: envelope.code,
            message: envelope.message,
        });
    }

    serde_json::from_value(envelope.data)
        .map_err(|e| FetchError::malformed(format!("unexpected response data: {}", e)))
}

/// Pull a filename out of a `Content-Disposition` header, preferring the
/// RFC 5987 `filename*` form.
fn filename_from_disposition(value: &str) -> Option<String> {
    let params: Vec<&str> = value.split(';').map(str::trim).collect();

    let extended = params.iter().find_map(|p| {
        let encoded = p.strip_prefix("filename*=")?.trim_matches('"');
        let raw = encoded.split_once("''").map(|(_, v)| v).unwrap_or(encoded);
        urlencoding::decode(raw).ok().map(|s| s.into_owned())
    });
    let plain = || {
        params
            .iter()
            .find_map(|p| p.strip_prefix("filename=").map(|v| v.trim_matches('"').to_string()))
    };

    extended
        .or_else(plain)
        .map(|name| name.replace(['/', '\\'], "_"))
        .filter(|name| !name.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

    fn client(server: &MockServer, token: Option<&str>) -> SurveyApiClient {
        SurveyApiClient::new(
            &format!("{}/v1/paper_search/", server.uri()),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn ok(data: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"code": 0, "message": "success", "data": data}))
    }

    #[tokio::test]
    async fn test_progress_completed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/paper_search/paper_survey/abc/progress"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ok(json!({
                "survey_id": "abc",
                "status": "completed",
                "progress": 1.0,
                "progress_msg": "Done",
                "survey_title": "Transformers",
                "survey_content": "See ##1$$.",
                "papers": [{"title": "X", "source": "kb", "similarity": 0.8}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = client(&server, Some("secret")).progress("abc").await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.title.as_deref(), Some("Transformers"));
        let content = report.content.unwrap();
        assert_eq!(content.document_body, "See ##1$$.");
        assert_eq!(content.source_list[0].display_title(), "X");
    }

    #[tokio::test]
    async fn test_progress_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/paper_search/paper_survey/missing/progress"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 102,
                "message": "Survey not found",
                "data": false
            })))
            .mount(&server)
            .await;

        let err = client(&server, None).progress("missing").await.unwrap_err();
        match err {
            FetchError::Api { code, message } => {
                assert_eq!(code, 102);
                assert_eq!(message, "Survey not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server, None).progress("abc").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_progress_rejects_malformed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ok(json!({"status": "processing"})))
            .mount(&server)
            .await;

        let err = client(&server, None).progress("abc").await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_progress_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = client(&server, None).progress("abc").await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/paper_search/paper_survey/abc/cancel"))
            .respond_with(ok(json!({"message": "Task cancelled"})))
            .expect(1)
            .mount(&server)
            .await;

        let msg = client(&server, None).cancel("abc").await.unwrap();
        assert_eq!(msg, "Task cancelled");
    }

    #[tokio::test]
    async fn test_download_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/paper_search/paper_survey_doc"))
            .and(body_json(json!({"survey_id": "abc", "format": "docx"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"PK\x03\x04docx".to_vec(), DOCX)
                    .insert_header(
                        "content-disposition",
                        "attachment; filename*=UTF-8''Deep%20Learning_20250101_120000.docx",
                    ),
            )
            .mount(&server)
            .await;

        let file = client(&server, None).download("abc", "docx").await.unwrap();
        assert_eq!(file.filename, "Deep Learning_20250101_120000.docx");
        assert_eq!(file.bytes, b"PK\x03\x04docx".to_vec());
    }

    #[tokio::test]
    async fn test_download_error_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/paper_search/paper_survey_doc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 100,
                "message": "Survey is not finished",
                "data": null
            })))
            .mount(&server)
            .await;

        let err = client(&server, None).download("abc", "docx").await.unwrap_err();
        assert!(matches!(err, FetchError::Api { code: 100, .. }));
    }

    #[tokio::test]
    async fn test_survey_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/paper_search/survey_history"))
            .and(query_param("page", "2"))
            .and(query_param("page_size", "5"))
            .and(query_param("keyword", "graph"))
            .respond_with(ok(json!({
                "total": 6,
                "records": [{
                    "id": "s6",
                    "search_record_id": "r1",
                    "survey_title": "Graph neural networks",
                    "status": "completed",
                    "created_at": 1735732800000i64
                }]
            })))
            .mount(&server)
            .await;

        let history = client(&server, None)
            .survey_history(2, 5, Some("graph"))
            .await
            .unwrap();
        assert_eq!(history.total, 6);
        assert_eq!(history.records[0].status, JobStatus::Completed);
        assert_eq!(
            history.records[0].created().map(|t| t.timestamp()),
            Some(1735732800)
        );
    }

    #[tokio::test]
    async fn test_delete_record() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/paper_search/paper_survey_record/abc"))
            .respond_with(ok(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, None).delete_record("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_record_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/paper_search/paper_survey_record/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 102,
                "message": "Delete failed or not permitted",
                "data": false
            })))
            .mount(&server)
            .await;

        let err = client(&server, None).delete_record("abc").await.unwrap_err();
        assert!(matches!(err, FetchError::Api { code: 102, .. }));
    }

    #[test]
    fn test_filename_plain_and_fallback() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"survey.docx\""),
            Some("survey.docx".to_string())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename*=UTF-8''a%2Fb.docx"),
            Some("a_b.docx".to_string())
        );
        assert_eq!(filename_from_disposition("attachment"), None);
    }
}
