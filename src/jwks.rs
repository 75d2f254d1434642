//! Process-scoped cache of JSON Web Key Sets, keyed by issuer.
//!
//! Fresh entries are served without waiting on anything. Stale or missing entries,
//! and explicit refreshes after an unknown key id, go through a per-issuer refresh
//! lock so at most one fetch per issuer is in flight; callers that queued behind it
//! take its outcome instead of fetching again. Refreshes forced by unknown key ids
//! are further limited to one per [`DEFAULT_JWKS_MIN_REFRESH`] per issuer.

use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::IssuerConfig;
use crate::utils::DEFAULT_JWKS_MIN_REFRESH;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwksError {
    #[error("JWKS fetch from {uri} failed: {reason}")]
    Fetch { uri: String, reason: String },
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// The key set an issuer currently publishes, tagged with the refresh generation
/// that produced it.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub generation: u64,
    pub keys: Arc<JwkSet>,
}

struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

#[derive(Default)]
struct IssuerState {
    generation: u64,
    cached: Option<CachedJwks>,
    last_failure: Option<(u64, JwksError)>,
    last_forced: Option<Instant>,
}

struct IssuerEntry {
    jwks_uri: Url,
    state: RwLock<IssuerState>,
    refresh: Mutex<()>,
}

pub struct JwksCache {
    http_client: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
    issuers: RwLock<HashMap<String, Arc<IssuerEntry>>>,
    fetches: AtomicU64,
}

impl JwksCache {
    pub fn new(ttl: Duration, fetch_timeout: Duration) -> Result<Self, JwksError> {
        let http_client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| JwksError::Client(e.to_string()))?;
        Ok(Self::with_client(http_client, ttl))
    }

    pub fn with_client(http_client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http_client,
            ttl,
            min_refresh_interval: DEFAULT_JWKS_MIN_REFRESH,
            issuers: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Shortest time between two forced refreshes of one issuer's key set.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Number of network fetches issued so far, across all issuers.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Returns the cached key set for `issuer`, fetching it when missing or past its TTL.
    pub async fn keys(&self, issuer: &IssuerConfig) -> Result<KeySnapshot, JwksError> {
        let entry = self.entry(issuer);
        let observed = {
            let state = entry.state.read();
            if let Some(cached) = &state.cached {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(KeySnapshot {
                        generation: state.generation,
                        keys: cached.keys.clone(),
                    });
                }
                debug!(issuer = %issuer.issuer, "JWKS cache entry expired");
            }
            state.generation
        };
        self.refresh_after(&entry, observed, false).await
    }

    /// Refetches the key set unless a refresh newer than `observed_generation`
    /// already completed, in which case that result is returned. Within the minimum
    /// refresh interval of the previous forced refresh the cached set is returned.
    pub async fn refresh(
        &self,
        issuer: &IssuerConfig,
        observed_generation: u64,
    ) -> Result<KeySnapshot, JwksError> {
        let entry = self.entry(issuer);
        self.refresh_after(&entry, observed_generation, true).await
    }

    fn entry(&self, issuer: &IssuerConfig) -> Arc<IssuerEntry> {
        if let Some(entry) = self.issuers.read().get(&issuer.issuer) {
            return entry.clone();
        }
        self.issuers
            .write()
            .entry(issuer.issuer.clone())
            .or_insert_with(|| {
                Arc::new(IssuerEntry {
                    jwks_uri: issuer.jwks_uri.clone(),
                    state: RwLock::new(IssuerState::default()),
                    refresh: Mutex::new(()),
                })
            })
            .clone()
    }

    async fn refresh_after(
        &self,
        entry: &IssuerEntry,
        observed: u64,
        forced: bool,
    ) -> Result<KeySnapshot, JwksError> {
        let _refreshing = entry.refresh.lock().await;

        {
            let state = entry.state.read();
            if state.generation != observed {
                debug!(jwks_uri = %entry.jwks_uri, "JWKS refreshed while waiting, reusing result");
                match (&state.last_failure, &state.cached) {
                    (Some((generation, error)), _) if *generation == state.generation => {
                        return Err(error.clone());
                    }
                    (_, Some(cached)) => {
                        return Ok(KeySnapshot {
                            generation: state.generation,
                            keys: cached.keys.clone(),
                        });
                    }
                    _ => {}
                }
            }

            let recent = state
                .last_forced
                .is_some_and(|at| at.elapsed() < self.min_refresh_interval);
            if let (true, true, Some(cached)) = (forced, recent, &state.cached) {
                debug!(jwks_uri = %entry.jwks_uri, "JWKS refreshed too recently, serving cached set");
                return Ok(KeySnapshot {
                    generation: state.generation,
                    keys: cached.keys.clone(),
                });
            }
        }

        self.fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = self.fetch(&entry.jwks_uri).await;

        let mut state = entry.state.write();
        state.generation += 1;
        if forced {
            state.last_forced = Some(Instant::now());
        }
        match outcome {
            Ok(jwks) => {
                let keys = Arc::new(jwks);
                state.cached = Some(CachedJwks {
                    keys: keys.clone(),
                    fetched_at: Instant::now(),
                });
                state.last_failure = None;
                Ok(KeySnapshot {
                    generation: state.generation,
                    keys,
                })
            }
            Err(error) => {
                state.last_failure = Some((state.generation, error.clone()));
                Err(error)
            }
        }
    }

    async fn fetch(&self, jwks_uri: &Url) -> Result<JwkSet, JwksError> {
        info!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let fetch_error = |reason: String| JwksError::Fetch {
            uri: jwks_uri.to_string(),
            reason,
        };

        let response = self
            .http_client
            .get(jwks_uri.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            warn!(jwks_uri = %jwks_uri, status = %response.status(), "JWKS endpoint returned error status");
            return Err(fetch_error(format!("status {}", response.status())));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| fetch_error(format!("invalid JWKS document: {e}")))?;

        info!(jwks_uri = %jwks_uri, key_count = jwks.keys.len(), "Fetched JWKS");
        Ok(jwks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn issuer_for(server: &MockServer) -> IssuerConfig {
        IssuerConfig::new(server.uri(), "https://mcp.example.com")
            .unwrap()
            .with_jwks_uri(&format!("{}/jwks", server.uri()))
            .unwrap()
    }

    fn empty_set() -> serde_json::Value {
        json!({ "keys": [] })
    }

    #[tokio::test]
    async fn fresh_entries_are_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_set()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        let issuer = issuer_for(&server).await;

        let first = cache.keys(&issuer).await.unwrap();
        let second = cache.keys(&issuer).await.unwrap();

        assert_eq!(first.generation, second.generation);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_set()))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_millis(20), Duration::from_secs(5)).unwrap();
        let issuer = issuer_for(&server).await;

        cache.keys(&issuer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.keys(&issuer).await.unwrap();

        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn unreachable_issuer_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        let issuer = issuer_for(&server).await;

        let err = cache.keys(&issuer).await.unwrap_err();
        assert!(matches!(err, JwksError::Fetch { .. }));
    }

    #[tokio::test]
    async fn stale_generation_reuses_completed_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_set()))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        let issuer = issuer_for(&server).await;

        let primed = cache.keys(&issuer).await.unwrap();
        let refreshed = cache.refresh(&issuer, primed.generation).await.unwrap();
        // A caller still holding the primed generation gets the newer result for free.
        let late = cache.refresh(&issuer, primed.generation).await.unwrap();

        assert_eq!(refreshed.generation, late.generation);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn forced_refreshes_are_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_set()))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        let issuer = issuer_for(&server).await;

        // Two unknown key ids in a row: only the first reaches the issuer.
        let first = cache.refresh(&issuer, 0).await.unwrap();
        let second = cache.refresh(&issuer, first.generation).await.unwrap();

        assert_eq!(first.generation, second.generation);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn forced_refresh_resumes_after_the_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_set()))
            .mount(&server)
            .await;

        let cache = JwksCache::new(Duration::from_secs(60), Duration::from_secs(5))
            .unwrap()
            .with_min_refresh_interval(Duration::from_millis(20));
        let issuer = issuer_for(&server).await;

        let first = cache.refresh(&issuer, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = cache.refresh(&issuer, first.generation).await.unwrap();

        assert!(second.generation > first.generation);
        assert_eq!(cache.fetch_count(), 2);
    }
}
