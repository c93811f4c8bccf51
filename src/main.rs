//! devicegrid CLI - Parallel mobile UI test orchestration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use devicegrid::config::{self, Config};
use devicegrid::coordinator::SuiteDescriptor;
use devicegrid::device::Platform;
use devicegrid::error::OrchestratorError;
use devicegrid::orchestrator::Orchestrator;
use devicegrid::report;

#[derive(Parser)]
#[command(name = "devicegrid")]
#[command(about = "Parallel mobile UI test orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devicegrid.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite on every available device
    Run {
        /// Limit the number of devices used
        #[arg(short = 'n', long)]
        max_devices: Option<usize>,

        /// Override the retry count
        #[arg(short, long)]
        retries: Option<u32>,

        /// Only use these platforms (android, ios)
        #[arg(short, long, value_delimiter = ',')]
        platform: Vec<Platform>,

        /// Do not start the automation server
        #[arg(long)]
        no_server: bool,
    },

    /// List devices on the configured platforms
    Devices {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Inspect test data
    #[command(subcommand)]
    Data(DataCommands),

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Platforms to enable (android, ios)
        #[arg(short, long, value_delimiter = ',', default_value = "android,ios")]
        platform: Vec<Platform>,
    },
}

#[derive(Subcommand)]
enum DataCommands {
    /// Print one field of a test case
    Get {
        /// Test case id, e.g. LOGIN_001
        test_case: String,
        /// Field name, e.g. password
        field: String,
    },

    /// Print every field of a test case as JSON, or list test case ids
    Dump {
        /// Test case id, e.g. LOGIN_001. Lists every id when omitted.
        test_case: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            max_devices,
            retries,
            platform,
            no_server,
        } => run_suite(&cli.config, max_devices, retries, platform, no_server).await,
        Commands::Devices { format } => list_devices(&cli.config, &format).await,
        Commands::Data(DataCommands::Get { test_case, field }) => {
            data_get(&cli.config, &test_case, &field).await
        }
        Commands::Data(DataCommands::Dump { test_case }) => {
            data_dump(&cli.config, test_case.as_deref()).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { platform } => init_config(&platform),
    }
}

async fn run_suite(
    config_path: &Path,
    max_devices: Option<usize>,
    retries: Option<u32>,
    platforms: Vec<Platform>,
    no_server: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if max_devices.is_some() {
        config.orchestrator.max_devices = max_devices;
    }
    if let Some(retries) = retries {
        config.orchestrator.retry_count = retries;
    }
    if !platforms.is_empty() {
        config.orchestrator.platforms = platforms;
    }
    if no_server {
        config.orchestrator.start_server = false;
    }
    config.validate()?;

    info!("Loaded configuration from {}", config_path.display());

    let suite = SuiteDescriptor::from(&config.suite);
    let orchestrator = Orchestrator::new(config);

    match orchestrator.run_suite(&suite).await {
        Ok(summary) => {
            report::print_summary(&suite.name, &summary);
            std::process::exit(summary.exit_code());
        }
        Err(e) => match e.downcast_ref::<OrchestratorError>() {
            Some(err) if err.is_fatal() => {
                eprintln!(
                    "{}: {}",
                    console::style(format!("error[{}]", err.code())).red().bold(),
                    err
                );
                eprintln!("{}: {}", console::style("suggestion").cyan(), err.suggestion());
                std::process::exit(1);
            }
            _ => Err(e),
        },
    }
}

async fn list_devices(config_path: &Path, format: &str) -> Result<()> {
    let config = load_or_default(config_path)?;
    let orchestrator = Orchestrator::new(config);
    let listings = orchestrator.list_devices().await;

    match format {
        "json" => {
            let devices: Vec<_> = listings
                .iter()
                .filter_map(|(_, result)| result.as_ref().ok())
                .flatten()
                .collect();
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        _ => {
            for (platform, result) in &listings {
                println!("{}:", console::style(platform).bold());
                match result {
                    Ok(devices) => report::print_devices(devices),
                    Err(e) => println!(
                        "  {} {}",
                        console::style(e).red(),
                        console::style(format!("({})", e.suggestion())).dim()
                    ),
                }
            }
        }
    }

    Ok(())
}

async fn data_get(config_path: &Path, test_case: &str, field: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_data(&config)?;
    let orchestrator = Orchestrator::new(config);

    println!("{}", orchestrator.data().get(test_case, field).await);
    Ok(())
}

async fn data_dump(config_path: &Path, test_case: Option<&str>) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_data(&config)?;
    let orchestrator = Orchestrator::new(config);

    let Some(test_case) = test_case else {
        for id in orchestrator.data().test_case_ids().await? {
            println!("{}", id);
        }
        return Ok(());
    };

    let row: std::collections::BTreeMap<_, _> =
        orchestrator.data().get_all(test_case).await.into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

fn require_data(config: &Config) -> Result<()> {
    if config.data.path.is_none() {
        anyhow::bail!("No test data configured. Set [data].path in the config file.");
    }
    Ok(())
}

/// Device listing works without a config file.
fn load_or_default(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        return config::load_config(config_path);
    }
    config::load_config_str(
        r#"
        [suite]
        name = "devices"
        command = "true"
        "#,
    )
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            let platforms: Vec<String> = config
                .orchestrator
                .platforms
                .iter()
                .map(|p| p.to_string())
                .collect();
            println!("  Platforms: {}", platforms.join(", "));
            println!("  Retry count: {}", config.orchestrator.retry_count);
            println!("  Suite timeout: {}s", config.orchestrator.suite_timeout_secs);
            match config.orchestrator.max_devices {
                Some(max) => println!("  Max devices: {}", max),
                None => println!("  Max devices: all"),
            }
            if config.orchestrator.start_server {
                println!(
                    "  Server: {} on {}:{}",
                    config.server.binary, config.server.address, config.server.port
                );
            } else {
                println!("  Server: external");
            }
            println!(
                "  Device ports: {}-{}",
                config.devices.port_range_start, config.devices.port_range_end
            );
            println!("  Suite: {}", config.suite.name);
            if let Some(path) = &config.data.path {
                println!("  Test data: {}", path.display());
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(platforms: &[Platform]) -> Result<()> {
    let platform_list: Vec<String> = platforms
        .iter()
        .map(|p| format!("\"{}\"", p.as_str()))
        .collect();

    let config = format!(
        r#"# devicegrid configuration file

[orchestrator]
platforms = [{}]
retry_count = 3
suite_timeout_secs = 1800

[server]
binary = "appium"
address = "127.0.0.1"
port = 4723

[devices]
boot_timeout_secs = 120
port_range_start = 4724
port_range_end = 4823

[suite]
name = "smoke"
# Placeholders: {{deviceId}} {{platform}} {{deviceName}} {{osVersion}} {{port}} {{serverUrl}}
command = "mvn -q test -Dudid={{deviceId}} -Dport={{port}}"
log_dir = "test-logs"

# [data]
# path = "testdata/testdata.json"
"#,
        platform_list.join(", ")
    );

    let path = PathBuf::from("devicegrid.toml");
    if path.exists() {
        eprintln!("devicegrid.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created devicegrid.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  devicegrid run");

    Ok(())
}
