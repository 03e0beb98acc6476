//! HTTP Provider Adapter
//!
//! Talks to a provider service over HTTP: `GET {base}/{account}?chain={chain}` returning a
//! JSON `ProviderResponse`. Upstream status codes are classified into `ProviderError`s so
//! the request worker can decide whether to retry.

use super::error::ProviderError;
use super::payload::{ProviderRequest, ProviderResponse};
use super::registry::ProviderRegistry;

use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpProvider {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn url_for(&self, request: &ProviderRequest) -> String {
        format!("{}/{}", self.base_url, request.account)
    }

    pub async fn fetch(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .get(self.url_for(&request))
            .query(&[("chain", request.chain.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                format!("{} {}", status, body.trim()),
            ));
        }

        response
            .json::<ProviderResponse>()
            .await
            .map_err(|e| ProviderError::InvalidRequest(format!("Malformed provider response: {}", e)))
    }

    /// Registers this endpoint in `registry` under `provider`, serving every chain.
    pub fn register(self, registry: &Arc<ProviderRegistry>, provider: &str) {
        let provider_http = Arc::new(self);
        registry.register(provider, &[], move |request| {
            let provider_http = provider_http.clone();
            async move { provider_http.fetch(request).await }
        });
    }
}

fn classify_transport_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(error.to_string())
    } else {
        ProviderError::Transient(error.to_string())
    }
}
