use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub method: String,
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
	pub kind: String,
}

pub struct ProxyMetrics {
	requests: Family<RequestLabels, Counter>,
	upstream_errors: Family<UpstreamErrorLabels, Counter>,
}

impl ProxyMetrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"proxy_requests",
			"The total number of requests seen by the enforcing proxy",
			requests.clone(),
		);

		let upstream_errors = Family::default();
		registry.register(
			"proxy_upstream_errors",
			"The total number of upstream transport failures",
			upstream_errors.clone(),
		);

		ProxyMetrics {
			requests,
			upstream_errors,
		}
	}

	pub fn record_request(&self, method: &str, allowed: bool) {
		self
			.requests
			.get_or_create(&RequestLabels {
				method: method.to_string(),
				outcome: if allowed { "allowed" } else { "blocked" }.to_string(),
			})
			.inc();
	}

	pub fn record_upstream_error(&self, kind: &str) {
		self
			.upstream_errors
			.get_or_create(&UpstreamErrorLabels {
				kind: kind.to_string(),
			})
			.inc();
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
	pub mode: String,
	pub outcome: String,
}

pub struct ExecutorMetrics {
	executions: Family<ExecutionLabels, Counter>,
}

impl ExecutorMetrics {
	pub fn new(registry: &mut Registry) -> Self {
		let executions = Family::default();
		registry.register(
			"executions",
			"The total number of sandboxed executions",
			executions.clone(),
		);
		ExecutorMetrics { executions }
	}

	pub fn record_execution(&self, mode: &str, success: bool) {
		self
			.executions
			.get_or_create(&ExecutionLabels {
				mode: mode.to_string(),
				outcome: if success { "success" } else { "failure" }.to_string(),
			})
			.inc();
	}
}
