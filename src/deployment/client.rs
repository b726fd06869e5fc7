//! The minimal per-deployment inference client interface the core consumes.
//!
//! This is the seam `client_factory` plugs into (spec.md §6): the
//! [`Deployment`](super::Deployment) owns health/cooldown/usage bookkeeping
//! uniformly, while the actual HTTP transport is supplied per deployment.
//! Test doubles substitute an [`InferenceClient`] directly, matching the
//! teacher's "Provider is a capability interface" pattern in
//! `core/router/deployment.rs`.

use crate::error::{Result, SwitchboardError};
use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A finite, non-restartable sequence of streamed chunks.
pub type ChatStream = BoxStream<'static, Result<ChatChunk>>;

/// The inference client a [`Deployment`](super::Deployment) issues requests
/// through. Implementors own their own connection pool; `Switchboard::stop`
/// drops the last `Arc` reference to release it.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream>;
}

/// Azure OpenAI chat completions client. Grounded in the teacher's
/// `AzureChatHandler`: builds the `api-key` header, posts to
/// `{endpoint}/openai/deployments/{deployment}/chat/completions`, and parses
/// SSE `data: ` frames for the streaming path.
pub struct AzureInferenceClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    api_version: String,
    deployment_name: String,
}

impl AzureInferenceClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
        deployment_name: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SwitchboardError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
            api_version: api_version.into(),
            deployment_name: deployment_name.into(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.api_base.trim_end_matches('/'),
            self.deployment_name,
            self.api_version
        )
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "api-key",
            self.api_key
                .parse()
                .map_err(|_| SwitchboardError::Config("invalid api key header value".to_string()))?,
        );
        headers.insert("Content-Type", "application/json".parse().unwrap());
        Ok(headers)
    }
}

#[async_trait]
impl InferenceClient for AzureInferenceClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .http
            .post(self.url())
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| SwitchboardError::TransientUpstream {
                deployment: self.deployment_name.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(SwitchboardError::from_status(
                &self.deployment_name,
                status,
                body,
                retry_after_secs,
            ));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| SwitchboardError::TransientUpstream {
                deployment: self.deployment_name.clone(),
                message: format!("failed to parse response: {e}"),
            })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .http
            .post(self.url())
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| SwitchboardError::TransientUpstream {
                deployment: self.deployment_name.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SwitchboardError::from_status(&self.deployment_name, status, body, None));
        }

        use futures::StreamExt;
        let deployment_name = self.deployment_name.clone();
        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = bytes_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer.drain(..=line_end).collect::<String>();
                            let line = line.trim();

                            let Some(data) = line.strip_prefix("data: ") else { continue };
                            if data == "[DONE]" {
                                break;
                            }
                            match serde_json::from_str::<ChatChunk>(data) {
                                Ok(chunk) => yield Ok(chunk),
                                Err(_) => continue,
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(SwitchboardError::TransientUpstream {
                            deployment: deployment_name.clone(),
                            message: format!("stream error: {e}"),
                        });
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
