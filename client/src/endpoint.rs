//! The save endpoint seam and its HTTP implementation.
//!
//! Saves and recalculations post the same atomic-operations body. The
//! server answers with one result per operation, in order; the root's new
//! state sits at the batch's root index.

use crate::config::Config;
use crate::error::EndpointError;
use async_trait::async_trait;
use draftline_engine::{ApiError, Operation, OperationBatch, RoundTripKind};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Media type of JSON:API documents.
pub const JSON_API: &str = "application/vnd.api+json";

/// What the server should do with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveAction {
    Calculate,
    AutoPlan,
    Save,
}

impl SaveAction {
    /// Whether nothing is persisted.
    pub fn is_dry_run(self) -> bool {
        self != SaveAction::Save
    }
}

impl From<RoundTripKind> for SaveAction {
    fn from(kind: RoundTripKind) -> Self {
        match kind {
            RoundTripKind::DryRun => SaveAction::Calculate,
            RoundTripKind::AutoPlan => SaveAction::AutoPlan,
            RoundTripKind::FullSave => SaveAction::Save,
        }
    }
}

/// Result of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Body posted for every round trip.
#[derive(Debug, Serialize)]
struct AtomicRequest<'a> {
    #[serde(rename = "atomic:operations")]
    operations: &'a [Operation],
    meta: RequestMeta,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestMeta {
    action: SaveAction,
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct AtomicResponse {
    #[serde(rename = "atomic:results", default)]
    results: Vec<OperationResult>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ApiError>,
}

/// Anything that runs operation batches.
#[async_trait]
pub trait SaveEndpoint: Send + Sync + 'static {
    /// Run a batch atomically and return one result per operation.
    async fn submit(
        &self,
        batch: &OperationBatch,
        action: SaveAction,
    ) -> Result<Vec<OperationResult>, EndpointError>;
}

/// Save endpoint reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.endpoint_url.clone(),
            token: config.api_token.clone(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl SaveEndpoint for HttpEndpoint {
    async fn submit(
        &self,
        batch: &OperationBatch,
        action: SaveAction,
    ) -> Result<Vec<OperationResult>, EndpointError> {
        let body = serde_json::to_vec(&AtomicRequest {
            operations: &batch.operations,
            meta: RequestMeta {
                action,
                dry_run: action.is_dry_run(),
            },
        })
        .map_err(|e| EndpointError::Malformed(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, JSON_API)
            .header(ACCEPT, JSON_API)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        match status {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::TOO_MANY_REQUESTS => {
                // Without an errors list this is a plain failure.
                let errors = match response.json::<ErrorResponse>().await {
                    Ok(body) if !body.errors.is_empty() => body.errors,
                    _ => return Err(EndpointError::Status(status.as_u16())),
                };
                tracing::debug!(status = status.as_u16(), errors = errors.len(), "batch rejected");
                Err(EndpointError::Validation(errors))
            }
            status if status.is_success() => {
                let body: AtomicResponse = response
                    .json()
                    .await
                    .map_err(|e| EndpointError::Malformed(e.to_string()))?;
                if body.results.len() != batch.len() {
                    return Err(EndpointError::Malformed(format!(
                        "expected {} results, got {}",
                        batch.len(),
                        body.results.len()
                    )));
                }
                Ok(body.results)
            }
            status => Err(EndpointError::Status(status.as_u16())),
        }
    }
}
