use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::policy::{Policy, PolicySpec};

#[derive(Debug, thiserror::Error)]
pub enum PolicyFetchError {
	#[error("no credential")]
	NoCredential,
	#[error("no policy endpoint configured")]
	NoEndpoint,
	#[error("policy request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("policy endpoint returned {0}")]
	Status(u16),
	#[error("policy response malformed: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("policy endpoint reported failure")]
	Unsuccessful,
}

/// Result of a policy lookup. `ok` is false whenever the fallback policy is
/// being used instead of the principal's own.
pub struct FetchOutcome {
	pub policy: Arc<Policy>,
	pub ok: bool,
	pub error: Option<String>,
}

// Wire envelope of the policy service. Unknown fields are opaque and ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PolicyEnvelope {
	success: bool,
	policy: Option<PolicySpec>,
}

impl Default for PolicyEnvelope {
	fn default() -> Self {
		PolicyEnvelope {
			success: false,
			policy: None,
		}
	}
}

struct CachedPolicy {
	policy: Arc<Policy>,
	inserted_at: Instant,
}

/// Fetches per-principal policies with a short-TTL memo per token. Errors
/// fall back to the default policy and are never cached.
pub struct PolicyFetcher {
	client: reqwest::Client,
	endpoint: Option<String>,
	ttl: Duration,
	default_policy: Arc<Policy>,
	cache: RwLock<HashMap<String, CachedPolicy>>,
}

impl PolicyFetcher {
	pub fn new(
		endpoint: Option<String>,
		ttl: Duration,
		timeout: Duration,
		default_policy: Policy,
	) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(PolicyFetcher {
			client,
			endpoint,
			ttl,
			default_policy: Arc::new(default_policy),
			cache: RwLock::new(HashMap::new()),
		})
	}

	pub fn default_policy(&self) -> Arc<Policy> {
		self.default_policy.clone()
	}

	/// Resolve the policy for `token`. Never fails: any upstream problem
	/// resolves to the default policy with `ok: false` and a reason.
	pub async fn fetch(&self, token: Option<&str>) -> FetchOutcome {
		let token = match token {
			Some(t) if !t.is_empty() => t,
			_ => return self.fallback(PolicyFetchError::NoCredential),
		};

		if let Some(cached) = self.lookup(token).await {
			debug!("policy cache hit");
			return FetchOutcome {
				policy: cached,
				ok: true,
				error: None,
			};
		}

		match self.fetch_remote(token).await {
			Ok(policy) => {
				let policy = Arc::new(policy);
				self.store(token, policy.clone()).await;
				FetchOutcome {
					policy,
					ok: true,
					error: None,
				}
			},
			Err(e) => self.fallback(e),
		}
	}

	pub async fn invalidate(&self, token: &str) {
		self.cache.write().await.remove(token);
	}

	pub async fn clear(&self) {
		self.cache.write().await.clear();
	}

	pub async fn cache_size(&self) -> usize {
		self.cache.read().await.len()
	}

	async fn lookup(&self, token: &str) -> Option<Arc<Policy>> {
		let cache = self.cache.read().await;
		let cached = cache.get(token)?;
		if cached.inserted_at.elapsed() < self.ttl {
			Some(cached.policy.clone())
		} else {
			None
		}
	}

	async fn store(&self, token: &str, policy: Arc<Policy>) {
		// Last write wins; duplicate concurrent fetches are acceptable.
		self.cache.write().await.insert(
			token.to_string(),
			CachedPolicy {
				policy,
				inserted_at: Instant::now(),
			},
		);
	}

	async fn fetch_remote(&self, token: &str) -> Result<Policy, PolicyFetchError> {
		let endpoint = self.endpoint.as_ref().ok_or(PolicyFetchError::NoEndpoint)?;
		let response = self
			.client
			.get(endpoint)
			.header(http::header::AUTHORIZATION, format!("Bearer {token}"))
			.send()
			.await?;
		let status = response.status();
		if !status.is_success() {
			return Err(PolicyFetchError::Status(status.as_u16()));
		}
		let body = response.text().await?;
		let envelope: PolicyEnvelope = serde_json::from_str(&body)?;
		if !envelope.success {
			return Err(PolicyFetchError::Unsuccessful);
		}
		Ok(Policy::new(envelope.policy.unwrap_or_default()))
	}

	fn fallback(&self, error: PolicyFetchError) -> FetchOutcome {
		if !matches!(error, PolicyFetchError::NoCredential) {
			warn!(error = %error, "policy fetch failed, using default policy");
		}
		FetchOutcome {
			policy: self.default_policy.clone(),
			ok: false,
			error: Some(error.to_string()),
		}
	}
}

static GLOBAL_FETCHER: OnceCell<Arc<PolicyFetcher>> = OnceCell::new();

/// Install the process-wide fetcher. Concurrent executions share its cache.
pub fn init_global(fetcher: Arc<PolicyFetcher>) {
	if GLOBAL_FETCHER.set(fetcher).is_err() {
		warn!("global policy fetcher already initialized");
	}
}

pub fn global() -> Option<Arc<PolicyFetcher>> {
	GLOBAL_FETCHER.get().cloned()
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn fetcher(endpoint: Option<String>, ttl: Duration) -> PolicyFetcher {
		PolicyFetcher::new(
			endpoint,
			ttl,
			Duration::from_secs(5),
			Policy::allow_domains(&["fallback.example".to_string()]),
		)
		.unwrap()
	}

	fn policy_body() -> serde_json::Value {
		serde_json::json!({
			"success": true,
			"policy": {
				"allowedDomains": ["api.stripe.com"],
				"apiPathRules": {
					"api.stripe.com": [
						{"method": "GET", "path": "/v1/products", "allow": true}
					]
				}
			}
		})
	}

	#[tokio::test]
	async fn fetch_sends_bearer_token_and_parses_policy() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/policy"))
			.and(header("authorization", "Bearer tok-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(policy_body()))
			.expect(1)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(format!("{}/policy", server.uri())), Duration::from_secs(60));
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(outcome.ok);
		assert!(outcome.error.is_none());
		assert!(outcome.policy.is_allowed("api.stripe.com", "GET", "/v1/products").allow);
		assert!(!outcome.policy.is_allowed("api.github.com", "GET", "/").allow);
	}

	#[tokio::test]
	async fn cache_hit_within_ttl_skips_upstream() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_json(policy_body()))
			.expect(1)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_secs(60));
		let first = fetcher.fetch(Some("tok-1")).await;
		let second = fetcher.fetch(Some("tok-1")).await;
		assert!(first.ok && second.ok);
		assert_eq!(fetcher.cache_size().await, 1);
		// expect(1) on the mock verifies no second upstream call was made.
	}

	#[tokio::test]
	async fn expired_entry_refetches() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_json(policy_body()))
			.expect(2)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_millis(10));
		fetcher.fetch(Some("tok-1")).await;
		tokio::time::sleep(Duration::from_millis(30)).await;
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(outcome.ok);
	}

	#[tokio::test]
	async fn empty_token_short_circuits_to_default() {
		let fetcher = fetcher(Some("http://127.0.0.1:1/policy".to_string()), Duration::from_secs(60));
		for token in [None, Some("")] {
			let outcome = fetcher.fetch(token).await;
			assert!(!outcome.ok);
			assert_eq!(outcome.error.as_deref(), Some("no credential"));
			assert!(outcome.policy.is_allowed("fallback.example", "GET", "/").allow);
		}
	}

	#[tokio::test]
	async fn server_error_falls_back_and_is_not_cached() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(500))
			.expect(2)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_secs(60));
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(!outcome.ok);
		assert!(outcome.error.as_deref().unwrap().contains("500"));
		assert_eq!(fetcher.cache_size().await, 0);
		// A second fetch goes upstream again; errors are never memoized.
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(!outcome.ok);
	}

	#[tokio::test]
	async fn malformed_body_falls_back() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string("not json"))
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_secs(60));
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(!outcome.ok);
		assert!(outcome.policy.is_allowed("fallback.example", "GET", "/").allow);
	}

	#[tokio::test]
	async fn unsuccessful_envelope_falls_back() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false})),
			)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_secs(60));
		let outcome = fetcher.fetch(Some("tok-1")).await;
		assert!(!outcome.ok);
	}

	#[tokio::test]
	async fn invalidate_forces_refetch() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_json(policy_body()))
			.expect(2)
			.mount(&server)
			.await;

		let fetcher = fetcher(Some(server.uri()), Duration::from_secs(60));
		fetcher.fetch(Some("tok-1")).await;
		fetcher.invalidate("tok-1").await;
		fetcher.fetch(Some("tok-1")).await;
	}
}
