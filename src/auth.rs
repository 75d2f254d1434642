use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

use crate::config::IssuerConfig;
use crate::jwks::JwksCache;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),
    #[error("No signing key matches key id {0:?}")]
    UnknownKey(Option<String>),
    #[error("Invalid token signature: {0}")]
    SignatureInvalid(String),
    #[error("Token has expired")]
    Expired,
    #[error("Token is not valid yet")]
    NotYetValid,
    #[error("Token audience does not match this resource")]
    AudienceMismatch,
    #[error("Token was not issued by the configured issuer")]
    IssuerMismatch,
    #[error("Issuer unreachable: {0}")]
    IssuerUnreachable(String),
}

impl AuthError {
    /// Short, stable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "malformed_token",
            Self::UnknownKey(_) => "unknown_key",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::IssuerUnreachable(_) => "issuer_unreachable",
        }
    }

    /// True when the failure lies with the issuer rather than the presented credential.
    pub fn is_upstream_fault(&self) -> bool {
        matches!(self, Self::IssuerUnreachable(_))
    }
}

/// The identity a verified bearer token vouches for.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPrincipal {
    pub subject: String,
    pub issuer: String,
    pub scopes: Vec<String>,
    pub claims: Map<String, Value>,
    pub expires_at: SystemTime,
}

impl VerifiedPrincipal {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Verifies bearer tokens against the issuer's published key set.
pub struct TokenVerifier {
    issuer: IssuerConfig,
    cache: Arc<JwksCache>,
}

impl TokenVerifier {
    pub fn new(issuer: IssuerConfig, cache: Arc<JwksCache>) -> Self {
        Self { issuer, cache }
    }

    pub fn issuer(&self) -> &IssuerConfig {
        &self.issuer
    }

    pub fn cache(&self) -> &Arc<JwksCache> {
        &self.cache
    }

    /// Verifies `raw_token` and returns the principal it carries.
    ///
    /// At most one key-set refresh is spent per call, either on an unreachable
    /// issuer or on a key id the cached set does not know.
    pub async fn verify(&self, raw_token: &str) -> Result<VerifiedPrincipal> {
        let (alg, kid) = self.inspect_header(raw_token)?;
        let mut refreshed = false;

        let snapshot = match self.cache.keys(&self.issuer).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(issuer = %self.issuer.issuer, error = %e, "JWKS unavailable, retrying once");
                refreshed = true;
                self.cache
                    .keys(&self.issuer)
                    .await
                    .map_err(|e| AuthError::IssuerUnreachable(e.to_string()))?
            }
        };

        let jwk = match select_key(&snapshot.keys, kid.as_deref()) {
            Some(jwk) => jwk.clone(),
            None if !refreshed => {
                debug!(issuer = %self.issuer.issuer, kid = ?kid, "Unknown key id, refreshing JWKS");
                let snapshot = self
                    .cache
                    .refresh(&self.issuer, snapshot.generation)
                    .await
                    .map_err(|e| AuthError::IssuerUnreachable(e.to_string()))?;
                select_key(&snapshot.keys, kid.as_deref())
                    .cloned()
                    .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?
            }
            None => return Err(AuthError::UnknownKey(kid)),
        };

        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::SignatureInvalid(format!("unusable key: {e}")))?;

        let mut validation = Validation::new(alg);
        validation.set_audience(&[self.issuer.audience.as_str()]);
        validation.set_issuer(&[self.issuer.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);
        validation.leeway = self.issuer.clock_skew.as_secs();
        validation.validate_nbf = true;

        let data = decode::<Map<String, Value>>(raw_token, &key, &validation)
            .map_err(|e| map_jwt_error(e.kind()))?;

        principal_from_claims(data.claims)
    }

    /// Reads the algorithm and key id without trusting anything else in the token.
    /// Unsigned and symmetric algorithms are refused here, before any key lookup.
    fn inspect_header(&self, raw_token: &str) -> Result<(Algorithm, Option<String>)> {
        let segments: Vec<&str> = raw_token.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::MalformedToken(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(segments[0].trim_end_matches('='))
            .map_err(|e| AuthError::MalformedToken(format!("header is not base64url: {e}")))?;
        let header: Value = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthError::MalformedToken(format!("header is not JSON: {e}")))?;

        let alg_name = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::MalformedToken("header has no alg".to_string()))?;
        if alg_name.eq_ignore_ascii_case("none") {
            return Err(AuthError::SignatureInvalid(
                "unsigned tokens are not accepted".to_string(),
            ));
        }
        let alg = Algorithm::from_str(alg_name).map_err(|_| {
            AuthError::SignatureInvalid(format!("unsupported algorithm {alg_name}"))
        })?;
        if !self.issuer.allowed_algorithms.contains(&alg) {
            return Err(AuthError::SignatureInvalid(format!(
                "algorithm {alg:?} is not allowed"
            )));
        }

        let parsed = decode_header(raw_token)
            .map_err(|e| AuthError::MalformedToken(format!("invalid header: {e}")))?;
        Ok((alg, parsed.kid))
    }
}

/// Picks the key named by `kid`, or the only key when the token names none.
fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

fn map_jwt_error(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::NotYetValid,
        ErrorKind::InvalidAudience => AuthError::AudienceMismatch,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
        ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => AuthError::AudienceMismatch,
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => AuthError::IssuerMismatch,
        ErrorKind::InvalidSignature => AuthError::SignatureInvalid("signature mismatch".to_string()),
        ErrorKind::InvalidAlgorithm => {
            AuthError::SignatureInvalid("key does not match the token algorithm".to_string())
        }
        other => {
            debug!(error = ?other, "Token rejected by decoder");
            AuthError::MalformedToken(format!("{other:?}"))
        }
    }
}

fn principal_from_claims(claims: Map<String, Value>) -> Result<VerifiedPrincipal> {
    let subject = claims
        .get("sub")
        .and_then(Value::as_str)
        .filter(|sub| !sub.is_empty())
        .ok_or_else(|| AuthError::MalformedToken("missing sub claim".to_string()))?
        .to_string();
    let issuer = claims
        .get("iss")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let exp = claims
        .get("exp")
        .and_then(Value::as_u64)
        .ok_or_else(|| AuthError::MalformedToken("exp is not a timestamp".to_string()))?;

    let scopes = match (claims.get("scope"), claims.get("scp")) {
        (Some(Value::String(scope)), _) => scope.split_whitespace().map(str::to_string).collect(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        (_, Some(Value::String(scp))) => scp.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    };

    Ok(VerifiedPrincipal {
        subject,
        issuer,
        scopes,
        claims,
        expires_at: UNIX_EPOCH + Duration::from_secs(exp),
    })
}
