use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::OntologyError;
use crate::config::OntologyConfig;

/// One node of the ontology as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyTerm {
    pub curie: String,
    pub name: String,
}

/// External ontology service consulted by the resolver.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OntologyService: Send + Sync {
    /// All transitive descendants of `id`, in service order.
    async fn descendants(&self, id: &str) -> Result<Vec<OntologyTerm>, OntologyError>;

    async fn term_name(&self, id: &str) -> Result<Option<String>, OntologyError>;

    /// Identifiers an organization has opted into.
    async fn subset(&self, org: &str) -> Result<Vec<String>, OntologyError>;
}

/// Rate-limited HTTP client for the ontology service.
#[derive(Debug, Clone)]
pub struct HttpOntologyClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpOntologyClient {
    pub fn new(config: &OntologyConfig) -> Result<Self, OntologyError> {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_capacity).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// GET a JSON document; `None` when the service answers 404.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, OntologyError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Ontology request");

        let mut request = self.http.get(&url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json::<T>().await?))
    }
}

#[async_trait]
impl OntologyService for HttpOntologyClient {
    async fn descendants(&self, id: &str) -> Result<Vec<OntologyTerm>, OntologyError> {
        Ok(self
            .get_json(&format!("/ontology/{id}/descendants"))
            .await?
            .unwrap_or_default())
    }

    async fn term_name(&self, id: &str) -> Result<Option<String>, OntologyError> {
        let term: Option<OntologyTerm> = self.get_json(&format!("/ontology/{id}")).await?;
        Ok(term.map(|t| t.name))
    }

    async fn subset(&self, org: &str) -> Result<Vec<String>, OntologyError> {
        Ok(self
            .get_json(&format!("/ontology/subset/{org}"))
            .await?
            .unwrap_or_default())
    }
}
