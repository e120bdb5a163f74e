use taskweave::cli::{Args, CliConfig, ConfigDiscovery, ExecutionMode, RunConfig, demo};
use taskweave::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Run(config) => run_mode(config).await,
        ExecutionMode::ShowConfig => {
            init_logging(false, None);
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
        ExecutionMode::InitConfig { dir } => {
            init_logging(false, None);
            let path = match dir {
                Some(dir) => ConfigDiscovery::create_default_config_in(&dir)?,
                None => ConfigDiscovery::create_default_user_config()?,
            };
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the config file, then the default
fn init_logging(verbose: bool, configured: Option<&str>) {
    let fallback = if verbose {
        env::VERBOSE_LOG_FILTER
    } else {
        configured.unwrap_or(env::DEFAULT_LOG_FILTER)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_mode(config: RunConfig) -> anyhow::Result<()> {
    let cli_config = match &config.config_override {
        Some(path) => CliConfig::from_toml_file(path)?,
        None => ConfigDiscovery::discover_config()?,
    };
    init_logging(config.verbose, cli_config.log_filter.as_deref());

    info!(
        "Running {} tasks x {} sub-tasks (fail rate {}, {} permits)",
        config.tasks, config.sub_tasks, config.fail_rate, config.permits
    );

    match demo::run_workload(cli_config.task_config, &config).await {
        Ok(stats) => {
            println!(
                "Finished {} tasks: {} completed, {} failed, {} cancelled",
                stats.total, stats.completed, stats.failed, stats.cancelled
            );
            Ok(())
        }
        Err(e) => {
            error!("Workload failed: {:#}", e);
            Err(e)
        }
    }
}
