//! Remote artifact storage seam.
//!
//! `RemoteStore` is the injectable fetch backend; production uses
//! `HttpRemoteStore` against the bucket's HTTP surface, tests substitute
//! fakes with programmable outcomes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credential::CredentialContext;
use crate::error::FetchError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches the object at `path` relative to the store root.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    credential: Arc<CredentialContext>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, credential: Arc<CredentialContext>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, base_url, credential }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.credential.bearer())
            .send()
            .await
            .map_err(|e| FetchError::Transient { reason: e.without_url().to_string() })?;
        let status = resp.status().as_u16();
        match status {
            200..=299 => resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| FetchError::Transient { reason: e.without_url().to_string() }),
            401 | 403 => Err(FetchError::AuthFailure { status }),
            404 => Err(FetchError::NotFound { path: path.to_string() }),
            _ => Err(FetchError::Transient { reason: format!("unexpected status {status}") }),
        }
    }
}
