//! fleetctl - fleet service control and health monitoring
//!
//! Runs service lifecycle commands, config rollouts and health checks across
//! the hosts of one environment, over SSH.

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use fleetctl_core::{
    evaluate, CooldownTracker, DefaultTransport, DispatchMode, FleetDispatcher, MetricsSampler,
    NotificationManager, NotifierSettings, Operation, RemoteExecutor, RetryPolicy, ServiceAction,
    SshTransport, ThresholdRule,
};

mod config;
mod report;
mod state;

use config::Config;
use state::FileCooldownStore;

/// fleetctl - service control and health monitoring for host fleets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FLEETCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Service lifecycle commands
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Metrics and health monitoring
    Monitor {
        #[command(subcommand)]
        command: MonitorCommands,
    },

    /// Configuration rollout
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// Check whether the service is active
    Status(ServiceArgs),
    /// Start the service
    Start(ServiceArgs),
    /// Stop the service
    Stop(ServiceArgs),
    /// Restart the service
    Restart(ServiceArgs),
}

#[derive(Subcommand, Debug)]
enum MonitorCommands {
    /// Collect CPU / memory / state metrics
    Metrics(ServiceArgs),

    /// Metrics table for every host of the environment
    Dashboard {
        /// Environment (directory under the inventory dir)
        #[arg(short, long)]
        env: String,

        /// Service name
        #[arg(short = 's', long = "service-name")]
        service: String,
    },

    /// Evaluate thresholds and send alerts
    Health(HealthArgs),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Upload a rendered configuration file
    Deploy {
        /// Local file to upload
        file: PathBuf,

        /// Environment (directory under the inventory dir)
        #[arg(short, long)]
        env: String,

        /// Remote destination path
        #[arg(long)]
        target_path: String,

        #[command(flatten)]
        target: Target,

        /// Skip the `.bak` copy of the existing file
        #[arg(long)]
        no_backup: bool,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Host index from the inventory
    #[arg(long, default_value_t = 0, conflicts_with = "all")]
    host_index: usize,

    /// Run against every host
    #[arg(long)]
    all: bool,
}

impl Target {
    fn mode(&self) -> DispatchMode {
        if self.all {
            DispatchMode::All
        } else {
            DispatchMode::Single(self.host_index)
        }
    }
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// Environment (directory under the inventory dir)
    #[arg(short, long)]
    env: String,

    /// Service name
    #[arg(short = 's', long = "service-name")]
    service: String,

    #[command(flatten)]
    target: Target,
}

#[derive(Args, Debug)]
struct HealthArgs {
    #[command(flatten)]
    service: ServiceArgs,

    /// Alert when CPU usage is at or above this percentage
    #[arg(long, default_value_t = 80.0)]
    cpu_threshold: f64,

    /// Alert when memory usage is at or above this percentage
    #[arg(long, default_value_t = 80.0)]
    memory_threshold: f64,

    /// Extra rule such as `cpu>95` (repeatable)
    #[arg(long = "rule")]
    rules: Vec<ThresholdRule>,

    /// Seconds before the same host/metric alert is sent again
    #[arg(long)]
    cooldown: Option<u64>,

    /// Do not alert when the service is inactive
    #[arg(long)]
    no_service_check: bool,
}

/// Engine pieces built from configuration
struct App {
    config: Config,
    dispatcher: FleetDispatcher,
    cancel: CancellationToken,
    json: bool,
}

impl App {
    fn new(config: Config, json: bool) -> Self {
        let ssh = SshTransport::new(config.ssh_key_path.clone())
            .with_strict_host_keys(config.strict_host_keys);
        let executor = RemoteExecutor::new(Arc::new(DefaultTransport::new(ssh))).with_retry(
            RetryPolicy {
                max_attempts: config.retry_attempts,
                ..RetryPolicy::default()
            },
        );
        let dispatcher =
            FleetDispatcher::new(Arc::new(executor)).with_max_parallel(config.max_parallel);

        Self {
            config,
            dispatcher,
            cancel: CancellationToken::new(),
            json,
        }
    }

    /// Cancel in-flight work on Ctrl-C
    fn watch_interrupt(&self) {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling remaining hosts");
                token.cancel();
            }
        });
    }

    async fn run(&self, command: Commands) -> anyhow::Result<i32> {
        match command {
            Commands::Service { command } => self.service(command).await,
            Commands::Monitor { command } => self.monitor(command).await,
            Commands::Config { command } => self.deploy(command).await,
        }
    }

    #[instrument(skip_all)]
    async fn service(&self, command: ServiceCommands) -> anyhow::Result<i32> {
        let (args, operation) = match command {
            ServiceCommands::Status(args) => {
                let op = Operation::service_status(&args.service)?;
                (args, op)
            }
            ServiceCommands::Start(args) => {
                let op = Operation::service(ServiceAction::Start, &args.service)?;
                (args, op)
            }
            ServiceCommands::Stop(args) => {
                let op = Operation::service(ServiceAction::Stop, &args.service)?;
                (args, op)
            }
            ServiceCommands::Restart(args) => {
                let op = Operation::service(ServiceAction::Restart, &args.service)?;
                (args, op)
            }
        };
        let operation = operation.with_timeout(self.config.timeout());

        let hosts = self.config.load_hosts(&args.env)?;
        info!(env = %args.env, operation = %operation.name, "Running service command");

        let result = self
            .dispatcher
            .dispatch_with_cancel(&hosts, &operation, args.target.mode(), &self.cancel)
            .await?;

        report::print_fleet_result(
            &format!("{} [{}]", operation.name, args.env),
            &result,
            self.json,
        )?;
        Ok(report::exit_code(result.verdict()))
    }

    async fn monitor(&self, command: MonitorCommands) -> anyhow::Result<i32> {
        let sampler = MetricsSampler::new(self.dispatcher.clone()).with_timeout(self.config.timeout());

        match command {
            MonitorCommands::Metrics(args) => {
                let hosts = self.config.load_hosts(&args.env)?;
                let (result, samples) = sampler
                    .sample(&hosts, &args.service, args.target.mode(), &self.cancel)
                    .await?;
                report::print_dashboard(&args.service, &result, &samples, self.json)?;
                Ok(report::exit_code(result.verdict()))
            }
            MonitorCommands::Dashboard { env, service } => {
                let hosts = self.config.load_hosts(&env)?;
                let (result, samples) = sampler
                    .sample(&hosts, &service, DispatchMode::All, &self.cancel)
                    .await?;
                report::print_dashboard(&service, &result, &samples, self.json)?;
                Ok(report::exit_code(result.verdict()))
            }
            MonitorCommands::Health(args) => self.health(&sampler, args).await,
        }
    }

    #[instrument(skip_all, fields(env = %args.service.env, service = %args.service.service))]
    async fn health(&self, sampler: &MetricsSampler, args: HealthArgs) -> anyhow::Result<i32> {
        // Malformed thresholds fail before any host is contacted
        let mut rules = vec![
            ThresholdRule::cpu(args.cpu_threshold)?,
            ThresholdRule::memory(args.memory_threshold)?,
        ];
        if !args.no_service_check {
            rules.push(ThresholdRule::service_down());
        }
        rules.extend(args.rules.iter().copied());

        let cooldown = Duration::from_secs(args.cooldown.unwrap_or(self.config.cooldown_secs));
        let store = Arc::new(FileCooldownStore::open(&self.config.state_file).await);
        let tracker = CooldownTracker::new(store, cooldown)?;

        let hosts = self.config.load_hosts(&args.service.env)?;
        let (result, samples) = sampler
            .sample(
                &hosts,
                &args.service.service,
                args.service.target.mode(),
                &self.cancel,
            )
            .await?;

        let evaluation = evaluate(&samples, &rules);
        let notifier =
            NotificationManager::from_settings(reqwest::Client::new(), &NotifierSettings::from_env());
        let summary = tracker
            .dispatch_alerts(
                &evaluation.alerts,
                &notifier,
                Some(&args.service.service),
                Utc::now(),
            )
            .await;

        report::print_health(&args.service.service, &result, &evaluation, summary, self.json)?;
        Ok(report::exit_code(result.verdict()))
    }

    #[instrument(skip_all)]
    async fn deploy(&self, command: ConfigCommands) -> anyhow::Result<i32> {
        let ConfigCommands::Deploy {
            file,
            env,
            target_path,
            target,
            no_backup,
        } = command;

        let payload = tokio::fs::read(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let operation =
            Operation::deploy(payload, target_path, !no_backup)?.with_timeout(self.config.timeout());

        let hosts = self.config.load_hosts(&env)?;
        info!(env = %env, file = %file.display(), operation = %operation.name, "Deploying configuration");

        let result = self
            .dispatcher
            .dispatch_with_cancel(&hosts, &operation, target.mode(), &self.cancel)
            .await?;

        report::print_fleet_result(&format!("{} [{}]", operation.name, env), &result, self.json)?;
        Ok(report::exit_code(result.verdict()))
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleetctl=debug,fleetctl_core=debug".into());

    // stdout is reserved for reports
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let code = match Config::load(cli.config.as_deref()) {
        Ok(config) => {
            let app = App::new(config, cli.json);
            app.watch_interrupt();
            match app.run(cli.command).await {
                Ok(code) => code,
                Err(e) => {
                    error!("Command failed: {:#}", e);
                    1
                }
            }
        }
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            1
        }
    };

    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_target_selection() {
        let cli = Cli::parse_from(["fleetctl", "service", "status", "-e", "prod", "-s", "nginx"]);
        let Commands::Service {
            command: ServiceCommands::Status(args),
        } = cli.command
        else {
            panic!("expected service status");
        };
        assert_eq!(args.target.mode(), DispatchMode::Single(0));

        let cli = Cli::parse_from([
            "fleetctl", "service", "restart", "-e", "prod", "-s", "nginx", "--all",
        ]);
        let Commands::Service {
            command: ServiceCommands::Restart(args),
        } = cli.command
        else {
            panic!("expected service restart");
        };
        assert_eq!(args.target.mode(), DispatchMode::All);

        assert!(Cli::try_parse_from([
            "fleetctl", "service", "stop", "-e", "prod", "-s", "nginx", "--all", "--host-index", "2",
        ])
        .is_err());
    }

    #[test]
    fn test_health_rules_parse() {
        let cli = Cli::parse_from([
            "fleetctl", "monitor", "health", "-e", "dev", "-s", "api", "--cpu-threshold", "90",
            "--rule", "memory>95", "--cooldown", "60",
        ]);
        let Commands::Monitor {
            command: MonitorCommands::Health(args),
        } = cli.command
        else {
            panic!("expected monitor health");
        };
        assert_eq!(args.cpu_threshold, 90.0);
        assert_eq!(args.memory_threshold, 80.0);
        assert_eq!(args.rules.len(), 1);
        assert_eq!(args.cooldown, Some(60));
        assert!(!args.no_service_check);
    }
}
