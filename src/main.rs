use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use execgateway::config;
use execgateway::executor::{ExecutionCoordinator, ExecutionRequest};
use execgateway::policy::Policy;
use execgateway::policyfetch::{self, PolicyFetcher};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Execution request as a JSON file ({code, env, timeoutMs, principalToken})
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,

	/// Inline source to execute (alternative to --file)
	#[arg(short, long, value_name = "code")]
	code: Option<String>,

	/// Gateway configuration file (JSON); environment variables win
	#[arg(long, value_name = "file")]
	config: Option<std::path::PathBuf>,

	/// Principal token for policy retrieval
	#[arg(short, long, value_name = "token")]
	token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();

	let config_contents = match &args.config {
		Some(path) => Some(tokio::fs::read_to_string(path).await?),
		None => None,
	};
	let config = Arc::new(config::parse_config(config_contents)?);

	let mut request: ExecutionRequest = match (&args.file, &args.code) {
		(Some(path), None) => {
			let contents = tokio::fs::read_to_string(path).await?;
			serde_json::from_str(&contents)?
		},
		(None, Some(code)) => ExecutionRequest {
			code: code.clone(),
			..Default::default()
		},
		(Some(_), Some(_)) => {
			eprintln!("Error: both --file and --code cannot be provided, exiting");
			std::process::exit(1);
		},
		(None, None) => {
			eprintln!("Error: either --file or --code must be provided, exiting");
			std::process::exit(1);
		},
	};
	if args.token.is_some() {
		request.principal_token = args.token;
	}

	let fetcher = Arc::new(PolicyFetcher::new(
		config.policy_endpoint.clone(),
		config.policy_cache_ttl,
		config.policy_timeout,
		Policy::allow_domains(&config.default_allowed_domains),
	)?);
	policyfetch::init_global(fetcher.clone());

	let mut registry = prometheus_client::registry::Registry::default();
	let coordinator =
		ExecutionCoordinator::new(config.mode, config.clone(), fetcher, &mut registry);

	let result = coordinator.execute(request).await;
	println!("{}", serde_json::to_string_pretty(&result)?);
	if !result.success {
		std::process::exit(1);
	}
	Ok(())
}
