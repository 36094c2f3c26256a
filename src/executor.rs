use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::audit::{AuditEntry, AuditSink};
use crate::config::Config;
use crate::metrics::{ExecutorMetrics, ProxyMetrics};
use crate::policy::Policy;
use crate::policyfetch::PolicyFetcher;
use crate::proxy::{self, ProxyOptions};
use crate::sandbox::{
	self, ContainerInfo, EXIT_INFRA_FAILURE, NetworkMode, RunOutput, SandboxError, SandboxOptions,
	SandboxRunner,
};

/// Execution mode, fixed at coordinator construction. The result shape is
/// identical across modes; fields that do not apply are omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
	/// Host child process; no container, no proxy.
	SpawnOnly,
	/// Container with network `none`; egress fails at the kernel.
	ContainerIsolated,
	/// Container routed through the proxy with an allow-all policy; the
	/// network log is an audit trail only.
	ContainerProxied,
	/// The full pipeline: per-principal policy enforced at the proxy.
	ContainerProxiedWithPolicy,
}

impl Mode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Mode::SpawnOnly => "spawnOnly",
			Mode::ContainerIsolated => "containerIsolated",
			Mode::ContainerProxied => "containerProxied",
			Mode::ContainerProxiedWithPolicy => "containerProxiedWithPolicy",
		}
	}
}

impl FromStr for Mode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"spawnOnly" | "spawn-only" => Ok(Mode::SpawnOnly),
			"containerIsolated" | "container-isolated" => Ok(Mode::ContainerIsolated),
			"containerProxied" | "container-proxied" => Ok(Mode::ContainerProxied),
			"containerProxiedWithPolicy" | "container-proxied-with-policy" => {
				Ok(Mode::ContainerProxiedWithPolicy)
			},
			other => Err(format!("unknown execution mode {other:?}")),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionRequest {
	pub code: String,
	pub env: HashMap<String, String>,
	/// Wall-clock cap in milliseconds; the configured default applies when
	/// absent.
	pub timeout_ms: Option<u64>,
	pub principal_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
	pub success: bool,
	pub stdout: String,
	pub stderr: String,
	pub exit_code: i64,
	pub execution_time_ms: u64,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub network_log: Vec<AuditEntry>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub container_info: Option<ContainerInfo>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub diagnostics: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
	#[error("proxy bind failed: {0}")]
	ProxyBind(#[from] proxy::ProxyError),
	#[error("container runtime error: {0}")]
	Sandbox(#[from] SandboxError),
}

/// Sequences policy retrieval, the enforcing proxy, and the sandbox into one
/// operation and folds everything into the unified result.
pub struct ExecutionCoordinator {
	mode: Mode,
	config: Arc<Config>,
	fetcher: Arc<PolicyFetcher>,
	proxy_metrics: Arc<ProxyMetrics>,
	executor_metrics: ExecutorMetrics,
}

impl ExecutionCoordinator {
	pub fn new(
		mode: Mode,
		config: Arc<Config>,
		fetcher: Arc<PolicyFetcher>,
		registry: &mut Registry,
	) -> Self {
		ExecutionCoordinator {
			mode,
			config,
			fetcher,
			proxy_metrics: Arc::new(ProxyMetrics::new(registry)),
			executor_metrics: ExecutorMetrics::new(registry),
		}
	}

	pub fn mode(&self) -> Mode {
		self.mode
	}

	/// Never fails: per-execution errors (proxy bind, container runtime) are
	/// folded into a `success: false` result with a sentinel exit code.
	pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
		let started = Instant::now();
		info!(mode = %self.mode.as_str(), "execution starting");
		let result = match self.execute_inner(&request).await {
			Ok(result) => result,
			Err(error) => failure_result(&error, started, Vec::new(), Vec::new()),
		};
		self
			.executor_metrics
			.record_execution(self.mode.as_str(), result.success);
		info!(
			success = result.success,
			exit_code = result.exit_code,
			requests = result.network_log.len(),
			"execution finished"
		);
		result
	}

	async fn execute_inner(
		&self,
		request: &ExecutionRequest,
	) -> Result<ExecutionResult, ExecuteError> {
		let timeout = request
			.timeout_ms
			.map(Duration::from_millis)
			.unwrap_or(self.config.execution_timeout);

		match self.mode {
			Mode::SpawnOnly => {
				let out = sandbox::run_unsandboxed(
					&request.code,
					&request.env,
					&self.config.runtime_command,
					&self.config.entry_file,
					timeout,
					self.config.max_output_bytes,
				)
				.await?;
				Ok(assemble(out, Vec::new(), Vec::new()))
			},
			Mode::ContainerIsolated => {
				let runner = self.runner(NetworkMode::None, timeout).await?;
				let out = runner.run(&request.code, &request.env, None).await?;
				Ok(assemble(out, Vec::new(), Vec::new()))
			},
			Mode::ContainerProxied | Mode::ContainerProxiedWithPolicy => {
				self.execute_proxied(request, timeout).await
			},
		}
	}

	async fn execute_proxied(
		&self,
		request: &ExecutionRequest,
		timeout: Duration,
	) -> Result<ExecutionResult, ExecuteError> {
		let started = Instant::now();
		let mut diagnostics = Vec::new();

		let policy = if self.mode == Mode::ContainerProxiedWithPolicy {
			let outcome = self.fetcher.fetch(request.principal_token.as_deref()).await;
			if !outcome.ok {
				diagnostics.push(format!(
					"policy fetch: {} (default policy applied)",
					outcome.error.unwrap_or_else(|| "unknown".to_string())
				));
			}
			outcome.policy
		} else {
			Arc::new(Policy::allow_all())
		};

		let sink = AuditSink::new(self.config.max_audit_entries);
		// Bind failure is fatal for the execution and bubbles out.
		let binding = proxy::start(
			policy,
			sink.clone(),
			ProxyOptions {
				port: self.config.proxy_port,
				upstream_timeout: self.config.upstream_timeout,
				shutdown_grace: self.config.proxy_shutdown_grace,
				metrics: Some(self.proxy_metrics.clone()),
				..Default::default()
			},
		)
		.await?;

		// The proxy listens on host loopback; the container reaches it via
		// the runtime's host alias on the same port.
		let proxy_url = binding.container_url(&self.config.host_alias);
		debug!(proxy = %proxy_url, "proxy reachable from container");

		let run = async {
			let runner = self.runner(NetworkMode::Bridge, timeout).await?;
			runner
				.run(&request.code, &request.env, Some(&proxy_url))
				.await
		}
		.await;

		// Stop on every path: the proxy must outlive the container, and the
		// sink must be fully drained before it is snapshotted.
		binding.stop().await;
		let (network_log, dropped) = sink.snapshot();
		if dropped > 0 {
			diagnostics.push(format!(
				"network log truncated: {dropped} oldest entries dropped"
			));
		}

		match run {
			Ok(out) => Ok(assemble(out, network_log, diagnostics)),
			Err(e) => Ok(failure_result(
				&ExecuteError::Sandbox(e),
				started,
				network_log,
				diagnostics,
			)),
		}
	}

	async fn runner(
		&self,
		network: NetworkMode,
		timeout: Duration,
	) -> Result<SandboxRunner, SandboxError> {
		SandboxRunner::connect(SandboxOptions {
			image: self.config.image.clone(),
			runtime_command: self.config.runtime_command.clone(),
			entry_file: self.config.entry_file.clone(),
			network,
			memory_bytes: self.config.memory_limit_bytes,
			nano_cpus: self.config.nano_cpus,
			timeout,
			max_output_bytes: self.config.max_output_bytes,
			auto_pull_image: self.config.auto_pull_image,
		})
		.await
	}
}

fn assemble(
	out: RunOutput,
	network_log: Vec<AuditEntry>,
	diagnostics: Vec<String>,
) -> ExecutionResult {
	ExecutionResult {
		success: out.exit_code == 0,
		stdout: out.stdout,
		stderr: out.stderr,
		exit_code: out.exit_code,
		execution_time_ms: out.execution_time.as_millis() as u64,
		network_log,
		container_info: out.container_info,
		diagnostics,
	}
}

fn failure_result(
	error: &ExecuteError,
	started: Instant,
	network_log: Vec<AuditEntry>,
	diagnostics: Vec<String>,
) -> ExecutionResult {
	ExecutionResult {
		success: false,
		stdout: String::new(),
		stderr: error.to_string(),
		exit_code: EXIT_INFRA_FAILURE,
		execution_time_ms: started.elapsed().as_millis() as u64,
		network_log,
		container_info: None,
		diagnostics,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config;

	fn coordinator(mode: Mode, overrides: impl FnOnce(&mut Config)) -> ExecutionCoordinator {
		let mut cfg = config::parse_config(None).unwrap();
		overrides(&mut cfg);
		let cfg = Arc::new(cfg);
		let fetcher = Arc::new(
			PolicyFetcher::new(
				None,
				cfg.policy_cache_ttl,
				cfg.policy_timeout,
				Policy::allow_domains(&cfg.default_allowed_domains),
			)
			.unwrap(),
		);
		let mut registry = Registry::default();
		ExecutionCoordinator::new(mode, cfg, fetcher, &mut registry)
	}

	#[test]
	fn mode_parses_both_spellings() {
		assert_eq!("spawnOnly".parse::<Mode>().unwrap(), Mode::SpawnOnly);
		assert_eq!(
			"container-proxied-with-policy".parse::<Mode>().unwrap(),
			Mode::ContainerProxiedWithPolicy
		);
		assert!("bogus".parse::<Mode>().is_err());
	}

	#[test]
	fn mode_serde_uses_camel_case() {
		assert_eq!(
			serde_json::to_string(&Mode::ContainerProxied).unwrap(),
			"\"containerProxied\""
		);
	}

	#[tokio::test]
	async fn spawn_only_runs_on_host() {
		// `cat` of the entry file echoes the code back; no container runtime
		// is involved in this mode.
		let coordinator = coordinator(Mode::SpawnOnly, |cfg| {
			cfg.runtime_command = "cat".to_string();
		});
		let result = coordinator
			.execute(ExecutionRequest {
				code: "console.log('hello')".to_string(),
				..Default::default()
			})
			.await;
		assert!(result.success, "stderr: {}", result.stderr);
		assert_eq!(result.exit_code, 0);
		assert!(result.stdout.contains("console.log('hello')"));
		assert!(result.network_log.is_empty());
		assert!(result.container_info.is_none());
	}

	#[tokio::test]
	async fn spawn_only_missing_runtime_is_a_structured_failure() {
		let coordinator = coordinator(Mode::SpawnOnly, |cfg| {
			cfg.runtime_command = "definitely-not-a-real-runtime-binary".to_string();
		});
		let result = coordinator
			.execute(ExecutionRequest {
				code: "x".to_string(),
				..Default::default()
			})
			.await;
		assert!(!result.success);
		assert_eq!(result.exit_code, EXIT_INFRA_FAILURE);
		assert!(result.stderr.contains("container runtime error"));
	}

	#[tokio::test]
	async fn spawn_only_timeout_yields_sentinel() {
		// `sh` executes the entry file as a script.
		let coordinator = coordinator(Mode::SpawnOnly, |cfg| {
			cfg.runtime_command = "sh".to_string();
		});
		let result = coordinator
			.execute(ExecutionRequest {
				code: "sleep 5".to_string(),
				timeout_ms: Some(100),
				..Default::default()
			})
			.await;
		assert!(!result.success);
		assert_eq!(result.exit_code, sandbox::EXIT_TIMEOUT);
		assert!(result.stderr.contains("timed out"));
	}

	#[test]
	fn result_serialization_omits_empty_optionals() {
		let result = ExecutionResult {
			success: true,
			stdout: "out".to_string(),
			stderr: String::new(),
			exit_code: 0,
			execution_time_ms: 12,
			network_log: Vec::new(),
			container_info: None,
			diagnostics: Vec::new(),
		};
		let json = serde_json::to_value(&result).unwrap();
		assert!(json.get("networkLog").is_none());
		assert!(json.get("containerInfo").is_none());
		assert!(json.get("diagnostics").is_none());
		assert_eq!(json["exitCode"], 0);
	}
}
