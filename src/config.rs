use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::executor::Mode;

// Conservative fallback allow-list used when a per-principal policy cannot
// be retrieved. Deployments override it via config or DEFAULT_ALLOWED_DOMAINS.
pub const BAKED_DEFAULT_ALLOWED_DOMAINS: &[&str] = &["registry.npmjs.org", "*.npmjs.org"];

#[derive(Debug, Clone)]
pub struct Config {
	pub mode: Mode,
	pub policy_endpoint: Option<String>,
	pub policy_cache_ttl: Duration,
	pub policy_timeout: Duration,
	pub default_allowed_domains: Vec<String>,
	pub image: String,
	pub runtime_command: String,
	pub entry_file: String,
	pub memory_limit_bytes: i64,
	pub nano_cpus: i64,
	pub auto_pull_image: bool,
	pub execution_timeout: Duration,
	pub upstream_timeout: Duration,
	pub proxy_port: u16,
	pub proxy_shutdown_grace: Duration,
	pub host_alias: String,
	pub max_output_bytes: usize,
	pub max_audit_entries: usize,
}

// File shape; every field optional, environment variables win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
	pub mode: Option<Mode>,
	pub policy_endpoint: Option<String>,
	pub policy_cache_ttl_secs: Option<u64>,
	pub policy_timeout_secs: Option<u64>,
	pub default_allowed_domains: Option<Vec<String>>,
	pub image: Option<String>,
	pub runtime_command: Option<String>,
	pub entry_file: Option<String>,
	pub memory_limit_mb: Option<i64>,
	pub cpu_cores: Option<f64>,
	pub auto_pull_image: Option<bool>,
	pub execution_timeout_ms: Option<u64>,
	pub upstream_timeout_secs: Option<u64>,
	pub proxy_port: Option<u16>,
	pub proxy_shutdown_grace_ms: Option<u64>,
	pub host_alias: Option<String>,
	pub max_output_bytes: Option<usize>,
	pub max_audit_entries: Option<usize>,
}

pub fn parse_config(contents: Option<String>) -> anyhow::Result<Config> {
	let raw: RawConfig = match contents {
		Some(contents) => serde_json::from_str(&contents)?,
		None => RawConfig::default(),
	};

	let default_allowed_domains = parse::<String>("DEFAULT_ALLOWED_DOMAINS")?
		.map(|s| s.split(',').map(|d| d.trim().to_string()).collect())
		.or(raw.default_allowed_domains)
		.unwrap_or_else(|| {
			BAKED_DEFAULT_ALLOWED_DOMAINS
				.iter()
				.map(|d| d.to_string())
				.collect()
		});

	Ok(Config {
		mode: parse::<Mode>("EXECUTOR_MODE")?
			.or(raw.mode)
			.unwrap_or(Mode::ContainerProxiedWithPolicy),
		policy_endpoint: parse("POLICY_ENDPOINT")?.or(raw.policy_endpoint),
		policy_cache_ttl: Duration::from_secs(
			parse("POLICY_CACHE_TTL_SECS")?
				.or(raw.policy_cache_ttl_secs)
				.unwrap_or(60),
		),
		policy_timeout: Duration::from_secs(
			parse("POLICY_TIMEOUT_SECS")?
				.or(raw.policy_timeout_secs)
				.unwrap_or(5),
		),
		default_allowed_domains,
		image: parse("SANDBOX_IMAGE")?
			.or(raw.image)
			.unwrap_or_else(|| "node:20-slim".to_string()),
		runtime_command: parse("SANDBOX_RUNTIME")?
			.or(raw.runtime_command)
			.unwrap_or_else(|| "node".to_string()),
		entry_file: parse("SANDBOX_ENTRY_FILE")?
			.or(raw.entry_file)
			.unwrap_or_else(|| "main.js".to_string()),
		memory_limit_bytes: parse::<i64>("SANDBOX_MEMORY_LIMIT_MB")?
			.or(raw.memory_limit_mb)
			.unwrap_or(512)
			* 1024 * 1024,
		nano_cpus: (parse::<f64>("SANDBOX_CPU_CORES")?
			.or(raw.cpu_cores)
			.unwrap_or(1.0)
			* 1_000_000_000.0) as i64,
		auto_pull_image: parse("SANDBOX_AUTO_PULL")?
			.or(raw.auto_pull_image)
			.unwrap_or(false),
		execution_timeout: Duration::from_millis(
			parse("EXECUTION_TIMEOUT_MS")?
				.or(raw.execution_timeout_ms)
				.unwrap_or(30_000),
		),
		upstream_timeout: Duration::from_secs(
			parse("UPSTREAM_TIMEOUT_SECS")?
				.or(raw.upstream_timeout_secs)
				.unwrap_or(30),
		),
		proxy_port: parse("PROXY_PORT")?.or(raw.proxy_port).unwrap_or(0),
		proxy_shutdown_grace: Duration::from_millis(
			parse("PROXY_SHUTDOWN_GRACE_MS")?
				.or(raw.proxy_shutdown_grace_ms)
				.unwrap_or(2_000),
		),
		host_alias: parse("PROXY_HOST_ALIAS")?
			.or(raw.host_alias)
			.unwrap_or_else(|| "host.docker.internal".to_string()),
		max_output_bytes: parse("MAX_OUTPUT_BYTES")?
			.or(raw.max_output_bytes)
			.unwrap_or(1024 * 1024),
		max_audit_entries: parse("MAX_AUDIT_ENTRIES")?
			.or(raw.max_audit_entries)
			.unwrap_or(10_000),
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match std::env::var(env) {
		Ok(value) if !value.is_empty() => value
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid {env} ({value}): {e}")),
		_ => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let cfg = parse_config(None).unwrap();
		assert_eq!(cfg.mode, Mode::ContainerProxiedWithPolicy);
		assert_eq!(cfg.policy_cache_ttl, Duration::from_secs(60));
		assert_eq!(cfg.policy_timeout, Duration::from_secs(5));
		assert_eq!(cfg.execution_timeout, Duration::from_secs(30));
		assert_eq!(cfg.memory_limit_bytes, 512 * 1024 * 1024);
		assert_eq!(cfg.nano_cpus, 1_000_000_000);
		assert_eq!(cfg.proxy_port, 0);
		assert_eq!(cfg.host_alias, "host.docker.internal");
		assert_eq!(cfg.max_output_bytes, 1024 * 1024);
		assert_eq!(cfg.max_audit_entries, 10_000);
		assert!(!cfg.default_allowed_domains.is_empty());
	}

	#[test]
	fn file_values_override_defaults() {
		let cfg = parse_config(Some(
			serde_json::json!({
				"mode": "containerIsolated",
				"policyEndpoint": "https://policy.internal/v1/policy",
				"policyCacheTtlSecs": 5,
				"image": "mycorp/runtime:1",
				"cpuCores": 0.5,
				"memoryLimitMb": 256,
				"defaultAllowedDomains": ["api.internal"],
				"maxAuditEntries": 50
			})
			.to_string(),
		))
		.unwrap();
		assert_eq!(cfg.mode, Mode::ContainerIsolated);
		assert_eq!(
			cfg.policy_endpoint.as_deref(),
			Some("https://policy.internal/v1/policy")
		);
		assert_eq!(cfg.policy_cache_ttl, Duration::from_secs(5));
		assert_eq!(cfg.image, "mycorp/runtime:1");
		assert_eq!(cfg.nano_cpus, 500_000_000);
		assert_eq!(cfg.memory_limit_bytes, 256 * 1024 * 1024);
		assert_eq!(cfg.default_allowed_domains, vec!["api.internal".to_string()]);
		assert_eq!(cfg.max_audit_entries, 50);
	}

	#[test]
	fn malformed_file_is_an_error() {
		assert!(parse_config(Some("not json".to_string())).is_err());
	}
}
