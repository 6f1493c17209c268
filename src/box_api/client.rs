use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::auth::TokenManager;
use crate::remote::RemoteError;

use super::types::BoxApiError;

const API_BASE: &str = "https://api.box.com/2.0";
const UPLOAD_BASE: &str = "https://upload.box.com/api/2.0";
const MAX_RETRIES: u32 = 5;

/// HTTP client for the Box Content API.
pub struct BoxClient {
    http: reqwest::Client,
    token_manager: Arc<TokenManager>,
}

impl BoxClient {
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    /// Request against api.box.com.
    pub(super) fn api_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        AuthenticatedRequest {
            client: self,
            builder: self.http.request(method, format!("{API_BASE}{path}")),
        }
    }

    /// Request against upload.box.com.
    pub(super) fn upload_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        AuthenticatedRequest {
            client: self,
            builder: self.http.request(method, format!("{UPLOAD_BASE}{path}")),
        }
    }
}

/// Attaches the bearer token and retries on rate limiting.
pub(super) struct AuthenticatedRequest<'a> {
    client: &'a BoxClient,
    builder: RequestBuilder,
}

impl AuthenticatedRequest<'_> {
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.builder = self.builder.query(params);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self
    }

    pub fn multipart(mut self, form: reqwest::multipart::Form) -> Self {
        self.builder = self.builder.multipart(form);
        self
    }

    /// Send with a fresh token, retrying 429 responses after `retry-after`
    /// plus jitter. 409 is handed back to the caller; 404 becomes
    /// [`RemoteError::NotFound`].
    pub async fn send(self) -> Result<Response> {
        let mut builder = self.builder;
        let mut attempt = 0;

        loop {
            let token = self.client.token_manager.get_access_token().await?;
            let retry_builder = builder.try_clone();

            let resp = builder
                .bearer_auth(&token)
                .send()
                .await
                .context("HTTP request failed")?;

            match resp.status() {
                s if s.is_success() || s == StatusCode::CONFLICT => return Ok(resp),

                StatusCode::TOO_MANY_REQUESTS if attempt < MAX_RETRIES => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(2);
                    let wait = Duration::from_secs(retry_after) + jitter();
                    attempt += 1;
                    tracing::warn!(retry_after, attempt, "rate limited, waiting {wait:?}");
                    tokio::time::sleep(wait).await;

                    builder = retry_builder
                        .context("Rate limited and the request body cannot be replayed")?;
                }

                StatusCode::TOO_MANY_REQUESTS => {
                    anyhow::bail!("Rate limited, gave up after {MAX_RETRIES} retries");
                }

                StatusCode::NOT_FOUND => {
                    return Err(RemoteError::NotFound(resp.url().path().to_string()).into());
                }

                status => {
                    let body = resp.text().await.unwrap_or_default();
                    if let Ok(err) = serde_json::from_str::<BoxApiError>(&body) {
                        anyhow::bail!("{err}");
                    }
                    anyhow::bail!("Box API error ({status}): {body}");
                }
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::random_range(0..1000))
}
