//! OAuth access tokens for Google APIs.
//!
//! Tokens are minted from the configured [`GcpCredentials`]. The
//! `google-cloud-auth` token source is built once and reused; it caches each
//! token until shortly before that token's own expiry. BigQuery and Sheets
//! share one token source, so the token carries both scopes.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use tokio::sync::OnceCell;

use crate::config::GcpCredentials;

/// Scopes requested for every token.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/bigquery.readonly",
    "https://www.googleapis.com/auth/spreadsheets",
];

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to read service account key file '{path}': {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse service account JSON: {0}")]
    KeyParse(#[from] serde_json::Error),

    #[error("failed to obtain access token: {0}")]
    Provider(String),
}

/// Source of bearer tokens for Google API calls.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Return a valid access token (without the `Bearer ` prefix).
    async fn access_token(&self) -> Result<String, TokenError>;
}

/// Token source backed by `google-cloud-auth`.
pub struct GcpTokenSource {
    credentials: GcpCredentials,
    source: OnceCell<Arc<dyn TokenSource>>,
}

impl GcpTokenSource {
    pub fn new(credentials: GcpCredentials) -> Self {
        Self {
            credentials,
            source: OnceCell::new(),
        }
    }

    /// Build the provider on first use. A failed build is retried on the
    /// next call.
    async fn token_source(&self) -> Result<&Arc<dyn TokenSource>, TokenError> {
        self.source
            .get_or_try_init(|| async {
                let source = self.build_provider().await?.token_source();
                tracing::debug!(credentials = self.credentials.kind(), "Initialized GCP token source");
                Ok(source)
            })
            .await
    }

    async fn build_provider(
        &self,
    ) -> Result<google_cloud_auth::token::DefaultTokenSourceProvider, TokenError> {
        let provider = match &self.credentials {
            GcpCredentials::Default => {
                let config = google_cloud_auth::project::Config::default().with_scopes(SCOPES);
                google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
                    .await
                    .map_err(|e| TokenError::Provider(e.to_string()))?
            }
            GcpCredentials::ServiceAccount { key_path } => {
                let json = read_key_file(Path::new(key_path)).await?;
                provider_from_json(&json).await?
            }
            GcpCredentials::ServiceAccountJson { json } => provider_from_json(json).await?,
        };
        Ok(provider)
    }
}

async fn read_key_file(path: &Path) -> Result<String, TokenError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TokenError::KeyFile {
            path: path.display().to_string(),
            source,
        })
}

async fn provider_from_json(
    json: &str,
) -> Result<google_cloud_auth::token::DefaultTokenSourceProvider, TokenError> {
    use google_cloud_auth::credentials::CredentialsFile;

    let creds: CredentialsFile = serde_json::from_str(json)?;
    let config = google_cloud_auth::project::Config::default().with_scopes(SCOPES);

    google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
        config,
        Box::new(creds),
    )
    .await
    .map_err(|e| TokenError::Provider(e.to_string()))
}

/// The token source returns `Bearer <token>`; callers add their own prefix.
fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

#[async_trait]
impl AccessTokenSource for GcpTokenSource {
    async fn access_token(&self) -> Result<String, TokenError> {
        let token = self
            .token_source()
            .await?
            .token()
            .await
            .map_err(|e| TokenError::Provider(e.to_string()))?;
        Ok(strip_bearer(&token).to_string())
    }
}

/// Standard Google API error envelope: `{"error": {"code", "message", "status"}}`.
#[derive(Debug, serde::Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, serde::Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Extract a readable message from a Google API error body, falling back to
/// the raw body (truncated) when it is not the standard envelope.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<GoogleErrorBody>(body) {
        Ok(parsed) => match parsed.error.status {
            Some(status) => format!("{}: {}", status, parsed.error.message),
            None => parsed.error.message,
        },
        Err(_) => body.chars().take(500).collect(),
    }
}

/// Fixed token, for tests against mock servers.
#[cfg(test)]
pub struct StaticTokenSource(pub String);

#[cfg(test)]
#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}
