pub mod headers;
pub mod hooks;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::metrics::ProxyMetrics;
use crate::policy::Policy;
use headers::{DEFAULT_SENSITIVE_HEADERS, HeaderFilter};
use hooks::{HookAction, NoopHook, ProxyHook, RequestSummary, ResponseOverride};

pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("failed to bind proxy listener on {addr}: {source}")]
	Bind {
		addr: String,
		source: std::io::Error,
	},
	#[error("failed to build upstream client: {0}")]
	Client(#[from] reqwest::Error),
}

pub struct ProxyOptions {
	/// Loopback port to bind; 0 picks an ephemeral port.
	pub port: u16,
	pub filter_sensitive_headers: bool,
	pub sensitive_headers: Vec<String>,
	pub capture_response_bodies: bool,
	pub hook: Arc<dyn ProxyHook>,
	pub upstream_timeout: Duration,
	pub shutdown_grace: Duration,
	pub metrics: Option<Arc<ProxyMetrics>>,
}

impl Default for ProxyOptions {
	fn default() -> Self {
		ProxyOptions {
			port: 0,
			filter_sensitive_headers: true,
			sensitive_headers: DEFAULT_SENSITIVE_HEADERS
				.iter()
				.map(|s| s.to_string())
				.collect(),
			capture_response_bodies: false,
			hook: Arc::new(NoopHook),
			upstream_timeout: Duration::from_secs(30),
			shutdown_grace: Duration::from_secs(2),
			metrics: None,
		}
	}
}

struct ProxyState {
	policy: Arc<Policy>,
	sink: AuditSink,
	filter: HeaderFilter,
	hook: Arc<dyn ProxyHook>,
	capture_response_bodies: bool,
	client: reqwest::Client,
	seq: AtomicU64,
	in_flight: Arc<AtomicUsize>,
	// Cancelled by stop() after the grace window; handlers racing this token
	// record a synthetic 499 and bail.
	hard_cancel: CancellationToken,
	metrics: Option<Arc<ProxyMetrics>>,
}

/// Runtime handle for a live proxy. Dropping without `stop()` aborts the
/// accept loop; `stop()` additionally drains in-flight requests into the
/// audit sink.
pub struct ProxyBinding {
	addr: SocketAddr,
	cancel: CancellationToken,
	hard_cancel: CancellationToken,
	in_flight: Arc<AtomicUsize>,
	accept_task: JoinHandle<()>,
	grace: Duration,
}

impl ProxyBinding {
	pub fn addr(&self) -> SocketAddr {
		self.addr
	}

	/// The proxy URL as seen from inside a container, via the runtime's
	/// host alias.
	pub fn container_url(&self, host_alias: &str) -> String {
		format!("http://{host_alias}:{}", self.addr.port())
	}

	/// Stop accepting, wait out the grace window for in-flight requests,
	/// then cancel stragglers (each records a 499 audit entry).
	pub async fn stop(self) {
		self.cancel.cancel();
		let deadline = Instant::now() + self.grace;
		while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		self.hard_cancel.cancel();
		let settle = Instant::now() + Duration::from_millis(500);
		while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < settle {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		self.accept_task.abort();
		debug!("proxy stopped");
	}
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
	fn new(counter: &Arc<AtomicUsize>) -> Self {
		counter.fetch_add(1, Ordering::SeqCst);
		InFlightGuard(counter.clone())
	}
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Bind the enforcing proxy on loopback and spawn its accept loop. Every
/// HTTP request and CONNECT tunnel is checked against `policy` and recorded
/// into `sink`.
pub async fn start(
	policy: Arc<Policy>,
	sink: AuditSink,
	options: ProxyOptions,
) -> Result<ProxyBinding, ProxyError> {
	let bind_addr = format!("127.0.0.1:{}", options.port);
	let listener = TcpListener::bind(&bind_addr)
		.await
		.map_err(|source| ProxyError::Bind {
			addr: bind_addr.clone(),
			source,
		})?;
	let addr = listener.local_addr().map_err(|source| ProxyError::Bind {
		addr: bind_addr,
		source,
	})?;

	// The forwarding client ignores ambient proxy env on the host; this
	// process IS the proxy.
	let client = reqwest::Client::builder()
		.timeout(options.upstream_timeout)
		.redirect(reqwest::redirect::Policy::none())
		.no_proxy()
		.build()?;

	let state = Arc::new(ProxyState {
		policy,
		sink,
		filter: HeaderFilter::new(options.filter_sensitive_headers, &options.sensitive_headers),
		hook: options.hook,
		capture_response_bodies: options.capture_response_bodies,
		client,
		seq: AtomicU64::new(0),
		in_flight: Arc::new(AtomicUsize::new(0)),
		hard_cancel: CancellationToken::new(),
		metrics: options.metrics,
	});

	let cancel = CancellationToken::new();
	let accept_cancel = cancel.clone();
	let accept_state = state.clone();
	let accept_task = tokio::spawn(async move {
		info!(%addr, "enforcing proxy listening");
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, peer)) => {
							debug!(%peer, "proxy connection accepted");
							let conn_state = accept_state.clone();
							tokio::spawn(async move {
								let io = TokioIo::new(stream);
								let service = service_fn(move |req| {
									let state = conn_state.clone();
									async move { handle(req, state).await }
								});
								if let Err(e) = http1::Builder::new()
									.preserve_header_case(true)
									.serve_connection(io, service)
									.with_upgrades()
									.await
								{
									debug!(error = %e, "proxy connection closed with error");
								}
							});
						},
						Err(e) => {
							warn!(error = %e, "proxy accept error");
						},
					}
				},
				_ = accept_cancel.cancelled() => {
					break;
				},
			}
		}
	});

	Ok(ProxyBinding {
		addr,
		cancel,
		hard_cancel: state.hard_cancel.clone(),
		in_flight: state.in_flight.clone(),
		accept_task,
		grace: options.shutdown_grace,
	})
}

async fn handle(
	req: Request<Incoming>,
	state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, std::convert::Infallible> {
	// Arrival order is fixed here, before any await point, so the audit log
	// reflects what the program tried to do in sequence.
	let seq = state.seq.fetch_add(1, Ordering::SeqCst);
	let _guard = InFlightGuard::new(&state.in_flight);

	if req.method() == Method::CONNECT {
		return Ok(handle_connect(req, state, seq).await);
	}
	Ok(handle_http(req, state, seq).await)
}

async fn handle_http(req: Request<Incoming>, state: Arc<ProxyState>, seq: u64) -> Response<ProxyBody> {
	let Some(target) = parse_target(&req) else {
		// Not a policy-visible event; no audit entry.
		debug!(uri = %req.uri(), "malformed proxy request");
		return text_response(StatusCode::BAD_REQUEST, "Bad Request");
	};
	let method = req.method().as_str().to_string();
	let mut entry = AuditEntry::new(&method, target.url.clone(), target.host.clone(), target.path.clone());
	entry.request_headers = state.filter.audit_view(req.headers());

	let decision = state.policy.is_allowed(&target.host, &method, &target.path);
	state.record_request(&method, decision.allow);
	if !decision.allow {
		let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
		info!(method = %method, url = %target.url, reason = %reason, "request blocked");
		state.sink.record(seq, entry.blocked(403, reason.clone()));
		return forbidden_json(&reason);
	}

	let summary = RequestSummary {
		method: method.clone(),
		url: target.url.clone(),
		hostname: target.host.clone(),
		path: target.path.clone(),
		headers: req.headers().clone(),
	};
	let mut extra_headers = None;
	match state.hook.on_request(&summary).await {
		HookAction::Continue => {},
		HookAction::SetHeaders(h) => extra_headers = Some(h),
		HookAction::Block => {
			let reason = "Blocked by hook".to_string();
			state.sink.record(seq, entry.blocked(403, reason.clone()));
			return forbidden_json(&reason);
		},
		HookAction::Mock(mock) => {
			let mut response = Response::builder().status(mock.status);
			for (name, value) in &mock.headers {
				response = response.header(name.as_str(), value.as_str());
			}
			entry.response_headers = mock
				.headers
				.iter()
				.map(|(name, value)| {
					let v = if state.filter.is_sensitive(name) {
						headers::REDACTED.to_string()
					} else {
						value.clone()
					};
					(name.to_ascii_lowercase(), v)
				})
				.collect();
			state.sink.record(seq, entry.completed(mock.status));
			return response
				.body(full(mock.body))
				.unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "mock build error"));
		},
	}

	let cancelled_entry = entry.clone();
	tokio::select! {
		response = forward_and_audit(req, &target, &summary, extra_headers, entry, &state, seq) => response,
		_ = state.hard_cancel.cancelled() => {
			state
				.sink
				.record(seq, cancelled_entry.failed(499, "execution ended".to_string()));
			text_response(StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY), "execution ended")
		},
	}
}

async fn forward_and_audit(
	req: Request<Incoming>,
	target: &Target,
	summary: &RequestSummary,
	extra_headers: Option<std::collections::HashMap<String, String>>,
	entry: AuditEntry,
	state: &Arc<ProxyState>,
	seq: u64,
) -> Response<ProxyBody> {
	let mut entry = entry;
	match forward_http(req, target, summary, extra_headers, state).await {
		Ok((response, response_headers)) => {
			entry.response_headers = response_headers;
			let status = response.status().as_u16();
			state.sink.record(seq, entry.completed(status));
			response
		},
		Err(failure) => {
			state.record_upstream_error(failure.kind);
			warn!(reason = %failure.reason, "upstream request failed");
			state
				.sink
				.record(seq, entry.failed(failure.status.as_u16(), failure.reason.clone()));
			text_response(failure.status, &failure.reason)
		},
	}
}

struct UpstreamFailure {
	status: StatusCode,
	reason: String,
	kind: &'static str,
}

async fn forward_http(
	req: Request<Incoming>,
	target: &Target,
	summary: &RequestSummary,
	extra_headers: Option<std::collections::HashMap<String, String>>,
	state: &Arc<ProxyState>,
) -> Result<(Response<ProxyBody>, Vec<(String, String)>), UpstreamFailure> {
	let (parts, body) = req.into_parts();

	let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
		.unwrap_or(reqwest::Method::GET);
	let mut builder = state.client.request(method, &target.url);
	for (name, value) in &parts.headers {
		if is_hop_by_hop(name.as_str()) || name == &http::header::HOST {
			continue;
		}
		if let Ok(v) = value.to_str() {
			builder = builder.header(name.as_str(), v);
		}
	}
	if let Some(extra) = extra_headers {
		for (name, value) in extra {
			builder = builder.header(name, value);
		}
	}

	// Proxy the request body as a stream; it is never buffered here.
	let body_stream = BodyStream::new(body)
		.try_filter_map(|frame| std::future::ready(Ok(frame.into_data().ok())));
	builder = builder.body(reqwest::Body::wrap_stream(body_stream));

	let upstream = builder.send().await.map_err(|e| {
		if e.is_timeout() {
			UpstreamFailure {
				status: StatusCode::GATEWAY_TIMEOUT,
				reason: format!("upstream timeout: {e}"),
				kind: "timeout",
			}
		} else {
			UpstreamFailure {
				status: StatusCode::BAD_GATEWAY,
				reason: format!("upstream request failed: {e}"),
				kind: "transport",
			}
		}
	})?;

	let status = upstream.status();
	let mut over = ResponseOverride {
		status: status.as_u16(),
		headers: upstream.headers().clone(),
		body: None,
	};
	let streamed = if state.capture_response_bodies {
		over.body = Some(upstream.bytes().await.map_err(|e| UpstreamFailure {
			status: StatusCode::BAD_GATEWAY,
			reason: format!("failed to read upstream body: {e}"),
			kind: "transport",
		})?);
		None
	} else {
		Some(upstream)
	};
	state.hook.on_response(summary, &mut over).await;
	// Audit sees the (redacted) headers as relayed; the container gets them
	// with sensitive entries removed outright.
	let audited_headers = state.filter.audit_view(&over.headers);
	state.filter.strip(&mut over.headers);

	let mut response = Response::builder().status(over.status);
	let replaced_body = over.body.is_some();
	for (name, value) in &over.headers {
		if is_hop_by_hop(name.as_str()) {
			continue;
		}
		// A replaced body invalidates the upstream framing.
		if replaced_body && name == &http::header::CONTENT_LENGTH {
			continue;
		}
		response = response.header(name, value);
	}

	let body = match (over.body, streamed) {
		(Some(bytes), _) => full(bytes),
		(None, Some(upstream)) => {
			let stream = upstream
				.bytes_stream()
				.map_ok(Frame::data)
				.map_err(std::io::Error::other);
			StreamBody::new(stream).boxed()
		},
		(None, None) => empty(),
	};
	let response = response
		.body(body)
		.unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build error"));
	Ok((response, audited_headers))
}

async fn handle_connect(
	req: Request<Incoming>,
	state: Arc<ProxyState>,
	seq: u64,
) -> Response<ProxyBody> {
	let Some(authority) = req.uri().authority().cloned() else {
		debug!("CONNECT without authority");
		return text_response(StatusCode::BAD_REQUEST, "Bad Request");
	};
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(443);
	let url = if port == 443 {
		format!("https://{host}")
	} else {
		format!("https://{host}:{port}")
	};
	let mut entry = AuditEntry::new("CONNECT", url, host.clone(), "/".to_string());
	entry.request_headers = state.filter.audit_view(req.headers());

	// The tunnel is opaque, so path rules cannot apply; HTTPS enforcement is
	// host-scoped.
	let decision = state.policy.is_allowed(&host, "CONNECT", "/");
	state.record_request("CONNECT", decision.allow);
	if !decision.allow {
		let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
		info!(host = %host, reason = %reason, "CONNECT blocked");
		state.sink.record(seq, entry.blocked(403, reason.clone()));
		return text_response(StatusCode::FORBIDDEN, &format!("Blocked: {reason}"));
	}

	let target = format!("{host}:{port}");
	let upstream = match tokio::time::timeout(
		Duration::from_secs(10),
		TcpStream::connect(&target),
	)
	.await
	{
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => {
			let reason = format!("failed to connect to {target}: {e}");
			state.record_upstream_error("transport");
			state.sink.record(seq, entry.failed(502, reason.clone()));
			return text_response(StatusCode::BAD_GATEWAY, &reason);
		},
		Err(_) => {
			let reason = format!("timed out connecting to {target}");
			state.record_upstream_error("timeout");
			state.sink.record(seq, entry.failed(504, reason.clone()));
			return text_response(StatusCode::GATEWAY_TIMEOUT, &reason);
		},
	};

	debug!(target = %target, "CONNECT tunnel established");
	state.sink.record(seq, entry.completed(200));

	let cancel = state.hard_cancel.clone();
	let in_flight = InFlightGuard::new(&state.in_flight);
	tokio::spawn(async move {
		let _guard = in_flight;
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let mut client = TokioIo::new(upgraded);
				let mut server = upstream;
				tokio::select! {
					result = tokio::io::copy_bidirectional(&mut client, &mut server) => {
						if let Err(e) = result {
							debug!(target = %target, error = %e, "tunnel closed");
						}
					},
					_ = cancel.cancelled() => {
						debug!(target = %target, "tunnel cancelled at shutdown");
					},
				}
			},
			Err(e) => {
				debug!(target = %target, error = %e, "CONNECT upgrade failed");
			},
		}
	});

	Response::builder()
		.status(StatusCode::OK)
		.body(empty())
		.unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build error"))
}

impl ProxyState {
	fn record_request(&self, method: &str, allowed: bool) {
		if let Some(metrics) = &self.metrics {
			metrics.record_request(method, allowed);
		}
	}

	fn record_upstream_error(&self, kind: &'static str) {
		if let Some(metrics) = &self.metrics {
			metrics.record_upstream_error(kind);
		}
	}
}

struct Target {
	host: String,
	path: String,
	url: String,
}

// A forward proxy receives absolute-form request lines for plain HTTP;
// origin-form requests fall back to the Host header.
fn parse_target<B>(req: &Request<B>) -> Option<Target> {
	let uri = req.uri();
	if let Some(host) = uri.host() {
		return Some(Target {
			host: host.to_string(),
			path: uri.path().to_string(),
			url: uri.to_string(),
		});
	}
	let host_header = req.headers().get(http::header::HOST)?.to_str().ok()?;
	let host = host_header
		.rsplit_once(':')
		.filter(|(_, p)| p.parse::<u16>().is_ok())
		.map(|(h, _)| h)
		.unwrap_or(host_header);
	let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	Some(Target {
		host: host.to_string(),
		path: uri.path().to_string(),
		url: format!("http://{host_header}{path_and_query}"),
	})
}

fn is_hop_by_hop(name: &str) -> bool {
	matches!(
		name.to_ascii_lowercase().as_str(),
		"connection"
			| "keep-alive"
			| "proxy-authenticate"
			| "proxy-authorization"
			| "proxy-connection"
			| "te"
			| "trailers"
			| "transfer-encoding"
			| "upgrade"
	)
}

fn full(bytes: impl Into<Bytes>) -> ProxyBody {
	Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

fn empty() -> ProxyBody {
	Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
	let mut response = Response::new(full(message.to_string()));
	*response.status_mut() = status;
	response.headers_mut().insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("text/plain"),
	);
	// Error responses end the connection; the client starts over if it wants.
	response.headers_mut().insert(
		http::header::CONNECTION,
		http::HeaderValue::from_static("close"),
	);
	response
}

fn forbidden_json(reason: &str) -> Response<ProxyBody> {
	let body = serde_json::json!({"error": "Forbidden", "reason": reason});
	let mut response = Response::new(full(body.to_string()));
	*response.status_mut() = StatusCode::FORBIDDEN;
	response.headers_mut().insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	response
}
