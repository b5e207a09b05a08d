//! Connection probing
//!
//! Local inference servers are heterogeneous and often briefly unreachable
//! (cold start, CORS misconfiguration), so every operation here is total:
//! nothing returns an error to the caller. Failures map to `false` or an
//! empty listing, and the connection is treated as unavailable rather than
//! blocking anything.

use std::time::Duration;

use crate::api::ModelsResponse;
use crate::core::store::ProviderKind;
use crate::utils::url::{construct_api_url, models_url};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(8);

pub struct ConnectionProber {
    client: reqwest::Client,
}

impl ConnectionProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Whether the endpoint answers its model-listing path with a success
    /// status within the probe timeout. Never errors.
    pub async fn probe(&self, base_url: &str, api_key: Option<&str>) -> bool {
        let url = models_url(base_url);
        let request = self
            .authorized_get(&url, api_key)
            .timeout(PROBE_TIMEOUT);

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "probe failed");
                false
            }
        }
    }

    /// Model ids available at the endpoint, sorted for stable display.
    /// Tolerates both listing shapes; any transport or parse failure
    /// yields an empty sequence.
    pub async fn list_models(&self, base_url: &str, api_key: Option<&str>) -> Vec<String> {
        let url = models_url(base_url);
        let request = self.authorized_get(&url, api_key).timeout(LIST_TIMEOUT);

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(url = %url, status = %response.status(), "model listing refused");
                return Vec::new();
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "model listing failed");
                return Vec::new();
            }
        };

        match response.json::<ModelsResponse>().await {
            Ok(listing) => {
                let mut ids = listing.into_ids();
                ids.sort();
                ids
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "model listing unparseable");
                Vec::new()
            }
        }
    }

    /// Ask a local server to load a model into memory. Providers disagree
    /// on the path; unknown providers get the text-generation-webui style
    /// internal load endpoint. Success is best-effort.
    pub async fn request_model_load(
        &self,
        base_url: &str,
        provider: ProviderKind,
        model: &str,
    ) -> bool {
        let (path, body) = match provider {
            ProviderKind::Ollama => (
                "api/generate",
                serde_json::json!({ "model": model }),
            ),
            _ => (
                "v1/internal/model/load",
                serde_json::json!({ "model_name": model }),
            ),
        };
        let url = construct_api_url(base_url, path);

        let request = self
            .client
            .post(&url)
            .timeout(LIST_TIMEOUT)
            .json(&body);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "model load request failed");
                false
            }
        }
    }

    fn authorized_get(&self, url: &str, api_key: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header("Content-Type", "application/json");
        if let Some(key) = api_key {
            if !key.is_empty() {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
        }
        request
    }
}
