//! Command line / environment configuration.
//!
//! Every flag can also come from the environment (a `.env` file is loaded
//! first if present).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use courier_core::domain::QueueSpec;
use courier_core::{CourierConfig, DispatchPolicy, RetryPolicy};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(about = "Background job service: HTTP producer and worker pool over a weighted queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP producer and the worker pool in one process
    Serve(ServeArgs),

    /// Validate the configuration, print it and exit
    CheckConfig(ServeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(short, long, env = "APP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Queues as `name=weight`, comma separated
    #[arg(long, env = "QUEUES", value_delimiter = ',', default_value = "critical=6,default=3,low=1")]
    pub queues: Vec<QueueSpec>,

    /// Queue used when a submit does not name one
    #[arg(long, env = "DEFAULT_QUEUE", default_value = "default")]
    pub default_queue: String,

    /// `weighted` (smooth weighted round-robin) or `strict` (can starve low queues)
    #[arg(long, env = "DISPATCH_POLICY", default_value = "weighted")]
    pub dispatch_policy: DispatchPolicy,

    #[arg(short, long, env = "WORKER_CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 1_000)]
    pub retry_base_delay_ms: u64,

    /// Jitter factor in [0, 1]
    #[arg(long, env = "RETRY_JITTER", default_value_t = 0.0)]
    pub retry_jitter: f64,

    #[arg(long, env = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: Option<u64>,

    #[arg(long, env = "TASK_MAX_RETRIES", default_value_t = 3)]
    pub default_max_retries: u32,

    #[arg(long, env = "TASK_TIMEOUT_MS", default_value_t = 30_000)]
    pub default_timeout_ms: u64,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "VISIBILITY_TIMEOUT_MS", default_value_t = 60_000)]
    pub visibility_timeout_ms: u64,

    #[arg(long, env = "API_SHUTDOWN_TIMEOUT_MS", default_value_t = 10_000)]
    pub api_shutdown_timeout_ms: u64,

    #[arg(long, env = "WORKER_SHUTDOWN_TIMEOUT_MS", default_value_t = 30_000)]
    pub worker_shutdown_timeout_ms: u64,

    #[arg(long, env = "ENQUEUE_TIMEOUT_MS", default_value_t = 2_000)]
    pub enqueue_timeout_ms: u64,

    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_MS", default_value_t = 2_000)]
    pub health_check_timeout_ms: u64,
}

impl ServeArgs {
    /// Build and validate the process configuration.
    pub fn to_config(&self) -> anyhow::Result<CourierConfig> {
        let mut retry = RetryPolicy::new(Duration::from_millis(self.retry_base_delay_ms))
            .with_jitter(self.retry_jitter);
        if let Some(max) = self.retry_max_delay_ms {
            retry = retry.with_max_delay(Duration::from_millis(max));
        }

        let config = CourierConfig {
            queues: self.queues.clone(),
            dispatch_policy: self.dispatch_policy,
            concurrency: self.concurrency,
            retry,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            worker_drain_timeout: Duration::from_millis(self.worker_shutdown_timeout_ms),
            http_drain_timeout: Duration::from_millis(self.api_shutdown_timeout_ms),
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            default_queue: self.default_queue.clone(),
            default_max_retries: self.default_max_retries,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            listen_addr: SocketAddr::new(self.host, self.port),
        };
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
pub fn init_tracing(log_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let default_filter = format!("courier={log_level},courier_core={log_level},tower_http=info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.context("failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["courier", "serve"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Serve(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_map_onto_config() {
        let config = serve_args(&[
            "--port",
            "9090",
            "--queues",
            "high=5,low=1",
            "--default-queue",
            "low",
            "--dispatch-policy",
            "strict",
            "--concurrency",
            "4",
            "--retry-base-delay-ms",
            "250",
            "--retry-max-delay-ms",
            "5000",
            "--worker-shutdown-timeout-ms",
            "1500",
        ])
        .to_config()
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(
            config.queues,
            vec![QueueSpec::new("high", 5), QueueSpec::new("low", 1)]
        );
        assert_eq!(config.dispatch_policy, DispatchPolicy::Strict);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Some(Duration::from_secs(5)));
        assert_eq!(config.worker_drain_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn malformed_queue_list_is_a_parse_error() {
        let argv = ["courier", "serve", "--queues", "critical=0"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn default_queue_must_be_configured() {
        let err = serve_args(&["--queues", "critical=6", "--default-queue", "default"])
            .to_config()
            .unwrap_err();
        assert!(format!("{err:#}").contains("default queue"));
    }

    #[test]
    fn log_format_is_a_global_flag() {
        let cli = Cli::try_parse_from(["courier", "check-config", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
