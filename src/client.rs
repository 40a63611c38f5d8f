use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::error::{ServiceError, ServiceErrorKind};
use crate::types::OutputCounts;
use crate::{AnalysisService, ExtractionService};

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Map a non-success HTTP status onto a failure kind.
pub fn classify_status(status: u16) -> ServiceErrorKind {
    match status {
        429 => ServiceErrorKind::RateLimited,
        402 => ServiceErrorKind::PaymentRequired,
        408 | 504 => ServiceErrorKind::Timeout,
        _ => ServiceErrorKind::Other,
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::timeout(err.to_string())
    } else {
        ServiceError::other(err.to_string())
    }
}

async fn check_status(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body)
    };
    Err(ServiceError::new(classify_status(status.as_u16()), message))
}

/// HTTP shim for the extraction and analysis functions and the two output
/// tables they write to.
///
/// # Example
/// ```no_run
/// use analysis_queue::{AnalysisService, HttpServiceClient};
///
/// # async fn example() -> Result<(), analysis_queue::ServiceError> {
/// let client = HttpServiceClient::new("https://project.example.co")
///     .with_api_key("service-role-key");
/// client.analyze("doc-1", true).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpServiceClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            api_key: None,
            timeout: Duration::from_secs(150),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Key sent as bearer token and `apikey` header.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Per-request timeout. An elapsed timeout is reported as
    /// [`ServiceErrorKind::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key).header("apikey", key),
            None => req,
        }
    }

    async fn call_function(&self, name: &str, body: serde_json::Value) -> Result<(), ServiceError> {
        let url = format!("{}/functions/v1/{}", self.endpoint, name);
        debug!(%url, "Invoking function");
        let resp = self
            .authorized(self.http.post(&url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str, document_id: &str) -> Result<u64, ServiceError> {
        let url = format!("{}/rest/v1/{}", self.endpoint, table);
        let resp = self
            .authorized(self.http.head(&url))
            .query(&[("select", "id"), ("document_id", &format!("eq.{}", document_id))])
            .header("Prefer", "count=exact")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(0);
        }
        resp.headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| {
                ServiceError::other(format!("Missing Content-Range total for {}", table))
            })
    }
}

impl ExtractionService for HttpServiceClient {
    async fn extract(&self, document_id: &str, force_re_extract: bool) -> Result<(), ServiceError> {
        self.call_function(
            "extract-text-with-vision",
            json!({ "document_id": document_id, "force_re_extract": force_re_extract }),
        )
        .await
    }
}

impl AnalysisService for HttpServiceClient {
    async fn analyze(&self, document_id: &str, bypass_limit: bool) -> Result<(), ServiceError> {
        self.call_function(
            "analyze-document",
            json!({ "document_id": document_id, "bypass_limit": bypass_limit }),
        )
        .await
    }

    async fn output_counts(&self, document_id: &str) -> Result<OutputCounts, ServiceError> {
        let (metrics, insights) = futures::try_join!(
            self.count_rows("document_metrics", document_id),
            self.count_rows("ai_insights", document_id),
        )?;
        Ok(OutputCounts { metrics, insights })
    }
}
