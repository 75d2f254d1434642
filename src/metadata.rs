use axum::{http::header, response::IntoResponse, routing::get, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{IssuerConfig, ResourceConfig};
use crate::utils::WELL_KNOWN_PROTECTED_RESOURCE;

/// OAuth 2.0 Protected Resource Metadata (RFC 9728).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_documentation: Option<String>,
}

impl ProtectedResourceMetadata {
    /// Authorization servers default to the configured token issuer.
    pub fn from_config(resource: &ResourceConfig, issuer: &IssuerConfig) -> Self {
        let authorization_servers = if resource.authorization_servers.is_empty() {
            vec![issuer.issuer.clone()]
        } else {
            resource.authorization_servers.clone()
        };

        Self {
            resource: resource.resource.to_string(),
            authorization_servers,
            scopes_supported: resource.scopes_supported.clone(),
            bearer_methods_supported: vec!["header".to_string()],
            resource_documentation: resource.resource_documentation.clone(),
        }
    }
}

/// Serves the metadata document, serialized once at startup.
#[derive(Debug)]
pub struct MetadataPublisher {
    document: ProtectedResourceMetadata,
    body: Bytes,
    well_known_url: String,
    paths: Vec<String>,
}

impl MetadataPublisher {
    pub fn new(
        resource: &ResourceConfig,
        issuer: &IssuerConfig,
    ) -> Result<Self, serde_json::Error> {
        let document = ProtectedResourceMetadata::from_config(resource, issuer);
        let body = Bytes::from(serde_json::to_vec(&document)?);

        let resource_path = resource.resource.path().trim_end_matches('/').to_string();
        let suffixed = format!("{WELL_KNOWN_PROTECTED_RESOURCE}{resource_path}");
        let well_known_url = format!(
            "{}{}",
            resource.resource.origin().ascii_serialization(),
            suffixed
        );

        let mut paths = vec![WELL_KNOWN_PROTECTED_RESOURCE.to_string()];
        if !resource_path.is_empty() {
            paths.push(suffixed);
        }

        Ok(Self {
            document,
            body,
            well_known_url,
            paths,
        })
    }

    pub fn metadata_document(&self) -> &ProtectedResourceMetadata {
        &self.document
    }

    /// The serialized document; identical on every call.
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    /// Absolute URL clients are pointed at from `WWW-Authenticate` challenges.
    pub fn well_known_url(&self) -> &str {
        &self.well_known_url
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

/// Routes serving the document at every well-known path.
pub fn router(publisher: Arc<MetadataPublisher>) -> Router {
    let mut router = Router::new();
    for path in publisher.paths() {
        let publisher = publisher.clone();
        router = router.route(
            path,
            get(move || {
                let body = publisher.body();
                async move { ([(header::CONTENT_TYPE, "application/json")], body).into_response() }
            }),
        );
    }
    router
}
