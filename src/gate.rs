//! The Auth Gate: every client-facing transport route passes through here.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::auth::{AuthError, TokenVerifier, VerifiedPrincipal};

/// Why a request was turned away. Callers only ever see a 401; the variants exist
/// so logs can tell the cases apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingHeader,
    MalformedHeader(&'static str),
    Invalid(AuthError),
}

impl Rejection {
    pub fn description(&self) -> String {
        match self {
            Self::MissingHeader | Self::MalformedHeader(_) => {
                "Missing or malformed bearer token".to_string()
            }
            Self::Invalid(e) => e.to_string(),
        }
    }
}

pub struct AuthGate {
    verifier: Arc<TokenVerifier>,
    resource_metadata_url: String,
}

impl AuthGate {
    pub fn new(verifier: Arc<TokenVerifier>, resource_metadata_url: impl Into<String>) -> Self {
        Self {
            verifier,
            resource_metadata_url: resource_metadata_url.into(),
        }
    }

    pub fn resource_metadata_url(&self) -> &str {
        &self.resource_metadata_url
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    /// Authorizes a request from its `Authorization` header.
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<VerifiedPrincipal, Rejection> {
        let token = match headers.get(header::AUTHORIZATION) {
            None => None,
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| self.log(Rejection::MalformedHeader("non-ASCII header value")))?,
            ),
        };
        self.authorize_credentials(token).await
    }

    /// Authorizes an `Authorization` header value (`Bearer <token>`) obtained some
    /// other way, such as the first line of a stdio bridge connection.
    pub async fn authorize_credentials(
        &self,
        credentials: Option<&str>,
    ) -> Result<VerifiedPrincipal, Rejection> {
        let Some(credentials) = credentials.map(str::trim).filter(|c| !c.is_empty()) else {
            return Err(self.log(Rejection::MissingHeader));
        };

        let token = match credentials.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            Some(_) => return Err(self.log(Rejection::MalformedHeader("not a bearer scheme"))),
            None => return Err(self.log(Rejection::MalformedHeader("missing token"))),
        };
        if token.is_empty() {
            return Err(self.log(Rejection::MalformedHeader("empty token")));
        }

        let principal = self
            .verifier
            .verify(token)
            .await
            .map_err(|e| self.log(Rejection::Invalid(e)))?;
        // Clock skew admits tokens that have already expired here; no session would
        // accept them.
        if principal.is_expired() {
            return Err(self.log(Rejection::Invalid(AuthError::Expired)));
        }
        Ok(principal)
    }

    fn log(&self, rejection: Rejection) -> Rejection {
        match &rejection {
            Rejection::MissingHeader => debug!("Rejected request without Authorization header"),
            Rejection::MalformedHeader(reason) => {
                debug!(reason, "Rejected request with malformed Authorization header")
            }
            Rejection::Invalid(e) if e.is_upstream_fault() => {
                error!(error = %e, "Token verification failed: upstream dependency fault")
            }
            Rejection::Invalid(e) => {
                warn!(kind = e.kind(), error = %e, "Rejected bearer token")
            }
        }
        rejection
    }

    /// The `WWW-Authenticate` value sent with every rejection.
    pub fn challenge(&self, rejection: &Rejection) -> String {
        format!(
            "Bearer resource_metadata=\"{}\", error=\"invalid_token\", error_description=\"{}\"",
            self.resource_metadata_url,
            rejection.description().replace(['"', '\\'], "'")
        )
    }

    pub fn reject(&self, rejection: &Rejection) -> Response {
        let challenge = self.challenge(rejection);
        let body = Json(json!({
            "error": "invalid_token",
            "error_description": rejection.description(),
        }));
        let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Middleware that admits only authorized requests, attaching the principal to the
/// request extensions for the transport handlers.
pub async fn require_bearer(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    match gate.authorize(request.headers()).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(rejection) => gate.reject(&rejection),
    }
}
