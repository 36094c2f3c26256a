use bollard::Docker;
use bollard::container::{
	AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions, LogOutput,
	RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WORKSPACE_DIR: &str = "/workspace";
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

// Exit code sentinels: the container never exits with these.
pub const EXIT_TIMEOUT: i64 = -1;
pub const EXIT_INFRA_FAILURE: i64 = -2;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
	#[error("container runtime unavailable: {0}")]
	RuntimeUnavailable(bollard::errors::Error),
	#[error("image {0} not found and auto-pull is disabled")]
	ImageMissing(String),
	#[error("failed to pull image: {0}")]
	Pull(bollard::errors::Error),
	#[error("failed to prepare work directory: {0}")]
	Workdir(std::io::Error),
	#[error("failed to create container: {0}")]
	Create(bollard::errors::Error),
	#[error("failed to attach to container: {0}")]
	Attach(bollard::errors::Error),
	#[error("failed to start container: {0}")]
	Start(bollard::errors::Error),
	#[error("failed waiting for container: {0}")]
	Wait(bollard::errors::Error),
	#[error("failed to spawn runtime process: {0}")]
	Spawn(std::io::Error),
}

/// How the container reaches the network: not at all, or through the bridge
/// with the enforcing proxy as its only configured route. The two are
/// mutually exclusive per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
	None,
	Bridge,
}

impl NetworkMode {
	fn as_str(&self) -> &'static str {
		match self {
			NetworkMode::None => "none",
			NetworkMode::Bridge => "bridge",
		}
	}
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
	pub image: String,
	/// Runtime binary inside the image; invoked directly, no shell.
	pub runtime_command: String,
	pub entry_file: String,
	pub network: NetworkMode,
	pub memory_bytes: i64,
	pub nano_cpus: i64,
	pub timeout: Duration,
	pub max_output_bytes: usize,
	pub auto_pull_image: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
	pub id: String,
	pub image: String,
	pub network_mode: NetworkMode,
}

#[derive(Debug)]
pub struct RunOutput {
	pub stdout: String,
	pub stderr: String,
	pub exit_code: i64,
	pub execution_time: Duration,
	pub timed_out: bool,
	pub container_info: Option<ContainerInfo>,
}

// Lifecycle of one container. `run` returns only from `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
	Created,
	Starting,
	Running,
	Exited,
	Killed,
	Removed,
}

/// Runs untrusted source in an ephemeral container. The work directory, the
/// container, and the attached streams are released on every exit path.
pub struct SandboxRunner {
	docker: Docker,
	options: SandboxOptions,
}

impl SandboxRunner {
	/// Connect to the container runtime and make sure the image is present.
	pub async fn connect(options: SandboxOptions) -> Result<Self, SandboxError> {
		let docker =
			Docker::connect_with_local_defaults().map_err(SandboxError::RuntimeUnavailable)?;
		docker
			.ping()
			.await
			.map_err(SandboxError::RuntimeUnavailable)?;
		let runner = SandboxRunner { docker, options };
		runner.ensure_image().await?;
		Ok(runner)
	}

	pub fn options(&self) -> &SandboxOptions {
		&self.options
	}

	async fn ensure_image(&self) -> Result<(), SandboxError> {
		if self.docker.inspect_image(&self.options.image).await.is_ok() {
			return Ok(());
		}
		if !self.options.auto_pull_image {
			return Err(SandboxError::ImageMissing(self.options.image.clone()));
		}
		info!(image = %self.options.image, "pulling image");
		let mut pull = std::pin::pin!(self.docker.create_image(
			Some(CreateImageOptions {
				from_image: self.options.image.clone(),
				..Default::default()
			}),
			None,
			None,
		));
		while let Some(progress) = pull.next().await {
			progress.map_err(SandboxError::Pull)?;
		}
		Ok(())
	}

	/// Write `code` into a fresh work directory, run it in a container, and
	/// collect its output. `proxy_url` is the container-reachable address of
	/// the enforcing proxy; when set, the standard proxy environment is
	/// injected so the runtime's HTTP libraries route through it.
	pub async fn run(
		&self,
		code: &str,
		env: &HashMap<String, String>,
		proxy_url: Option<&str>,
	) -> Result<RunOutput, SandboxError> {
		let start = Instant::now();
		let workdir = tempfile::TempDir::new().map_err(SandboxError::Workdir)?;
		let code_path = workdir.path().join(&self.options.entry_file);
		tokio::fs::write(&code_path, code)
			.await
			.map_err(SandboxError::Workdir)?;

		let (network_mode, extra_hosts) = match self.options.network {
			NetworkMode::None => (NetworkMode::None.as_str(), None),
			NetworkMode::Bridge => (
				NetworkMode::Bridge.as_str(),
				// Lets the container reach the proxy on the host loopback.
				Some(vec!["host.docker.internal:host-gateway".to_string()]),
			),
		};

		let host_config = HostConfig {
			memory: Some(self.options.memory_bytes),
			nano_cpus: Some(self.options.nano_cpus),
			network_mode: Some(network_mode.to_string()),
			readonly_rootfs: Some(true),
			binds: Some(vec![format!(
				"{}:{WORKSPACE_DIR}:ro",
				workdir.path().display()
			)]),
			extra_hosts,
			..Default::default()
		};

		let config = Config {
			image: Some(self.options.image.clone()),
			entrypoint: Some(vec![self.options.runtime_command.clone()]),
			cmd: Some(vec![format!("{WORKSPACE_DIR}/{}", self.options.entry_file)]),
			env: Some(container_env(env, proxy_url)),
			working_dir: Some(WORKSPACE_DIR.to_string()),
			attach_stdout: Some(true),
			attach_stderr: Some(true),
			host_config: Some(host_config),
			..Default::default()
		};

		let created = self
			.docker
			.create_container(None::<CreateContainerOptions<String>>, config)
			.await
			.map_err(SandboxError::Create)?;
		let id = created.id;
		let mut state = ContainerState::Created;
		debug!(container = %short_id(&id), ?state, "container created");

		let supervised = self.supervise(&id, &mut state).await;
		// Teardown runs regardless of how supervision ended; the work
		// directory goes with the TempDir when this function returns.
		self.remove(&id).await;
		state = ContainerState::Removed;
		debug!(container = %short_id(&id), ?state, "container removed");

		let (stdout, stderr, exit_code, timed_out) = supervised?;
		Ok(RunOutput {
			stdout,
			stderr,
			exit_code,
			execution_time: start.elapsed(),
			timed_out,
			container_info: Some(ContainerInfo {
				id: short_id(&id).to_string(),
				image: self.options.image.clone(),
				network_mode: self.options.network,
			}),
		})
	}

	async fn supervise(
		&self,
		id: &str,
		state: &mut ContainerState,
	) -> Result<(String, String, i64, bool), SandboxError> {
		// Attach before start so no early output is lost.
		let attach = self
			.docker
			.attach_container::<String>(
				id,
				Some(AttachContainerOptions {
					stdout: Some(true),
					stderr: Some(true),
					stream: Some(true),
					logs: Some(true),
					..Default::default()
				}),
			)
			.await
			.map_err(SandboxError::Attach)?;

		let cap = self.options.max_output_bytes;
		let mut output = attach.output;
		let drain = tokio::spawn(async move {
			let mut stdout = CappedBuffer::new(cap);
			let mut stderr = CappedBuffer::new(cap);
			while let Some(chunk) = output.next().await {
				match chunk {
					Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
						stdout.push(&message)
					},
					Ok(LogOutput::StdErr { message }) => stderr.push(&message),
					Ok(_) => {},
					Err(_) => break,
				}
			}
			(stdout.into_string(), stderr.into_string())
		});

		*state = ContainerState::Starting;
		self
			.docker
			.start_container(id, None::<StartContainerOptions<String>>)
			.await
			.map_err(SandboxError::Start)?;
		*state = ContainerState::Running;
		debug!(container = %short_id(id), "container running");

		let mut wait = std::pin::pin!(
			self
				.docker
				.wait_container(id, None::<WaitContainerOptions<String>>)
		);
		let (exit_code, timed_out) =
			match tokio::time::timeout(self.options.timeout, wait.next()).await {
				Ok(Some(Ok(status))) => {
					*state = ContainerState::Exited;
					(status.status_code, false)
				},
				// bollard reports a non-zero exit as a wait "error" carrying
				// the code; that is still a successful execution for us.
				Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
					*state = ContainerState::Exited;
					(code, false)
				},
				Ok(Some(Err(e))) => return Err(SandboxError::Wait(e)),
				Ok(None) => {
					*state = ContainerState::Exited;
					(EXIT_INFRA_FAILURE, false)
				},
				Err(_) => {
					warn!(container = %short_id(id), timeout = ?self.options.timeout, "execution timed out");
					let _ = self
						.docker
						.kill_container(id, Some(KillContainerOptions { signal: "SIGTERM" }))
						.await;
					tokio::time::sleep(Duration::from_secs(1)).await;
					let _ = self
						.docker
						.kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
						.await;
					*state = ContainerState::Killed;
					(EXIT_TIMEOUT, true)
				},
			};

		let (stdout, mut stderr) = match tokio::time::timeout(Duration::from_secs(2), drain).await {
			Ok(Ok(streams)) => streams,
			_ => (String::new(), String::new()),
		};
		if timed_out {
			if !stderr.is_empty() && !stderr.ends_with('\n') {
				stderr.push('\n');
			}
			stderr.push_str(&format!(
				"Execution timed out after {}ms; container was terminated",
				self.options.timeout.as_millis()
			));
		}
		Ok((stdout, stderr, exit_code, timed_out))
	}

	async fn remove(&self, id: &str) {
		if let Err(e) = self
			.docker
			.remove_container(
				id,
				Some(RemoveContainerOptions {
					force: true,
					v: true,
					..Default::default()
				}),
			)
			.await
		{
			// Already-gone containers are fine; anything else is worth a log.
			if !matches!(
				&e,
				bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
			) {
				warn!(container = %short_id(id), error = %e, "container removal failed");
			}
		}
	}
}

/// Run the code directly on the host, no container and no proxy. Used by the
/// spawn-only execution mode.
pub async fn run_unsandboxed(
	code: &str,
	env: &HashMap<String, String>,
	runtime_command: &str,
	entry_file: &str,
	timeout: Duration,
	max_output_bytes: usize,
) -> Result<RunOutput, SandboxError> {
	let start = Instant::now();
	let workdir = tempfile::TempDir::new().map_err(SandboxError::Workdir)?;
	let code_path = workdir.path().join(entry_file);
	tokio::fs::write(&code_path, code)
		.await
		.map_err(SandboxError::Workdir)?;

	let mut command = tokio::process::Command::new(runtime_command);
	command
		.arg(&code_path)
		.envs(env)
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);

	match tokio::time::timeout(timeout, command.output()).await {
		Ok(output) => {
			let output = output.map_err(SandboxError::Spawn)?;
			let mut stdout = CappedBuffer::new(max_output_bytes);
			stdout.push(&output.stdout);
			let mut stderr = CappedBuffer::new(max_output_bytes);
			stderr.push(&output.stderr);
			Ok(RunOutput {
				stdout: stdout.into_string(),
				stderr: stderr.into_string(),
				exit_code: output.status.code().map(i64::from).unwrap_or(EXIT_INFRA_FAILURE),
				execution_time: start.elapsed(),
				timed_out: false,
				container_info: None,
			})
		},
		Err(_) => {
			// Dropping the future kills the child (kill_on_drop); its output
			// is lost with it.
			Ok(RunOutput {
				stdout: String::new(),
				stderr: format!(
					"Execution timed out after {}ms; process was terminated",
					timeout.as_millis()
				),
				exit_code: EXIT_TIMEOUT,
				execution_time: start.elapsed(),
				timed_out: true,
				container_info: None,
			})
		},
	}
}

// The standard proxy environment plus the caller's variables. Proxy entries
// win on collision; the policy itself never appears here.
fn container_env(env: &HashMap<String, String>, proxy_url: Option<&str>) -> Vec<String> {
	let mut merged: BTreeMap<String, String> =
		env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
	if let Some(proxy) = proxy_url {
		for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
			merged.insert(key.to_string(), proxy.to_string());
		}
		merged.insert("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string());
	}
	merged
		.into_iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect()
}

fn short_id(id: &str) -> &str {
	&id[..id.len().min(12)]
}

struct CappedBuffer {
	buf: Vec<u8>,
	cap: usize,
	truncated: bool,
}

impl CappedBuffer {
	fn new(cap: usize) -> Self {
		CappedBuffer {
			buf: Vec::new(),
			cap,
			truncated: false,
		}
	}

	fn push(&mut self, chunk: &[u8]) {
		if self.truncated {
			return;
		}
		let remaining = self.cap.saturating_sub(self.buf.len());
		if chunk.len() <= remaining {
			self.buf.extend_from_slice(chunk);
		} else {
			self.buf.extend_from_slice(&chunk[..remaining]);
			self.truncated = true;
		}
	}

	fn into_string(self) -> String {
		let mut s = String::from_utf8_lossy(&self.buf).into_owned();
		if self.truncated {
			s.push_str(TRUNCATION_MARKER);
		}
		s
	}
}
