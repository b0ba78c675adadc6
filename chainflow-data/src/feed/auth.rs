use crate::error::FeedError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

/// Supplies bearer access tokens for the feed.
///
/// Token acquisition (eg/ the broker OAuth flow) lives outside this crate. Implementations return
/// [`FeedError::AuthRequired`] when no valid token is available.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, FeedError>;
}

/// [`TokenProvider`] reading the token from an environment variable on every call, so a token
/// refreshed externally is picked up by the next reconnect.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn access_token(&self) -> Result<String, FeedError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_owned()),
            _ => {
                warn!(var = %self.var, "feed access token not set");
                Err(FeedError::AuthRequired)
            }
        }
    }
}

/// [`TokenProvider`] returning a fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, FeedError> {
        Ok(self.0.clone())
    }
}

/// Exchanges a bearer token for an authorized feed transport URL.
#[async_trait]
pub trait FeedAuthorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Url, FeedError>;
}

/// [`FeedAuthorizer`] calling the broker's HTTP feed authorize endpoint.
#[derive(Debug, Clone)]
pub struct HttpFeedAuthorizer {
    http: reqwest::Client,
    authorize_url: Url,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    data: AuthorizeData,
}

#[derive(Debug, Deserialize)]
struct AuthorizeData {
    authorized_redirect_uri: Url,
}

impl HttpFeedAuthorizer {
    pub fn new(authorize_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            authorize_url,
        }
    }
}

#[async_trait]
impl FeedAuthorizer for HttpFeedAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Url, FeedError> {
        let response = self
            .http
            .get(self.authorize_url.clone())
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = %response.status(), "feed authorization rejected");
                return Err(FeedError::AuthRequired);
            }
            status if !status.is_success() => {
                return Err(FeedError::Authorization(format!(
                    "unexpected status: {status}"
                )));
            }
            _ => {}
        }

        let AuthorizeResponse { data } = response.json::<AuthorizeResponse>().await?;
        debug!(host = ?data.authorized_redirect_uri.host_str(), "feed authorized");
        Ok(data.authorized_redirect_uri)
    }
}
