// Ontology Module - term names and the process hierarchy behind workflow tags
//
// Tags are ontology identifiers. The resolver keeps an owned, TTL-cached view
// of the hierarchy fetched from an external ontology service.

pub mod client;
pub mod resolver;

pub use client::{HttpOntologyClient, OntologyService, OntologyTerm};
pub use resolver::{OntologyResolver, ResolverSettings};

#[cfg(any(test, feature = "testing"))]
pub use client::MockOntologyService;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OntologyError {
    #[error("ontology request failed: {0}")]
    Request(String),

    #[error("unexpected ontology response: {0}")]
    Decode(String),

    #[error("ontology service unavailable, reload retried in {retry_in_secs}s: {reason}")]
    Backoff { reason: String, retry_in_secs: u64 },

    #[error("unknown ontology term '{0}'")]
    UnknownTerm(String),
}

impl From<reqwest::Error> for OntologyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OntologyError::Decode(err.to_string())
        } else {
            OntologyError::Request(err.to_string())
        }
    }
}
