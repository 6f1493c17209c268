//! Access tokens for the Box API.
//!
//! Tokens are obtained by an external OAuth login and written to the token
//! file; this module only loads them and refreshes them before they expire.

mod token_store;

use token_store::TokenData;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::config::AuthConfig;

const TOKEN_URL: &str = "https://api.box.com/oauth2/token";

pub struct TokenManager {
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
    tokens: Mutex<Option<TokenData>>,
    http_client: reqwest::Client,
}

impl TokenManager {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        config.validate()?;
        let token_path = token_store::resolve_token_path(config.token_path.as_deref())?;
        let tokens = if token_path.exists() {
            match token_store::load_tokens(&token_path) {
                Ok(t) => {
                    tracing::info!(path = %token_path.display(), "loaded tokens");
                    Some(t)
                }
                Err(e) => {
                    tracing::warn!("failed to load tokens: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        if tokens.is_none() {
            tracing::warn!(path = %token_path.display(), "no usable tokens, remote calls will fail");
        }

        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_path,
            tokens: Mutex::new(tokens),
            http_client: reqwest::Client::new(),
        })
    }

    /// A valid access token, refreshed first if it expires within a minute.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut guard = self.tokens.lock().await;
        let tokens = guard.as_mut().with_context(|| {
            format!("Not authenticated: no tokens at {}", self.token_path.display())
        })?;

        if tokens.expires_within(chrono::Duration::seconds(60)) {
            tracing::debug!("access token expired or expiring soon, refreshing");
            let refreshed = self.refresh(tokens).await?;
            *tokens = refreshed;
            token_store::save_tokens(&self.token_path, tokens)?;
            tracing::debug!("token refreshed");
        }

        Ok(tokens.access_token.clone())
    }

    async fn refresh(&self, tokens: &TokenData) -> Result<TokenData> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: u64,
        }

        let resp = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to contact Box token endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Token refresh failed ({status}): {body}");
        }

        let tr: TokenResponse = resp
            .json()
            .await
            .context("Failed to parse token response")?;

        Ok(TokenData {
            access_token: tr.access_token,
            refresh_token: tr.refresh_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(tr.expires_in as i64),
        })
    }
}
