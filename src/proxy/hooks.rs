use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::collections::HashMap;

/// What the proxy knows about a request at hook time. Hooks run after policy
/// evaluation and before upstream forwarding.
#[derive(Debug, Clone)]
pub struct RequestSummary {
	pub method: String,
	pub url: String,
	pub hostname: String,
	pub path: String,
	pub headers: HeaderMap,
}

/// A canned response returned instead of calling upstream.
#[derive(Debug, Clone)]
pub struct MockResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum HookAction {
	/// Forward unchanged.
	Continue,
	/// Forward with these headers set on the upstream request.
	SetHeaders(HashMap<String, String>),
	/// Short-circuit with a mock; no upstream call is made. Still audited.
	Mock(MockResponse),
	/// Reject the request. Audited like a policy denial.
	Block,
}

/// Mutable view of an upstream response, offered to `on_response` before the
/// proxy relays it. Setting `body` replaces the (otherwise streamed) payload.
#[derive(Debug)]
pub struct ResponseOverride {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
}

#[async_trait]
pub trait ProxyHook: Send + Sync {
	async fn on_request(&self, _req: &RequestSummary) -> HookAction {
		HookAction::Continue
	}

	async fn on_response(&self, _req: &RequestSummary, _resp: &mut ResponseOverride) {}
}

/// Default hook: no mocking, no mutation.
#[derive(Debug, Default)]
pub struct NoopHook;

#[async_trait]
impl ProxyHook for NoopHook {}
