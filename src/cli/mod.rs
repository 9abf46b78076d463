//! Command line interface for the farmhand node agent
//!
//! Provides the operational entry points:
//! - `run`: Start the agent and process jobs until shutdown
//! - `check-config`: Validate a configuration file and print the effective settings
//! - `capabilities`: List the job types this build can execute
//! - `completions`: Generate shell completions

pub mod completions;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use farmhand::agent::AgentRuntime;
use farmhand::infrastructure::{init_logging, AgentConfig, ConfigOverrides};
use farmhand::job::CapabilityRegistry;

/// CLI arguments for farmhand
#[derive(Parser, Debug)]
#[command(name = "farmhand")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node agent
    Run {
        /// Configuration file (defaults apply if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the server URL from the config
        #[arg(long)]
        server_url: Option<String>,
        /// Override the node identifier (defaults to the hostname)
        #[arg(long)]
        node_id: Option<String>,
        /// Override the job working directory
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Override the log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file to validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the job types this build can execute
    Capabilities,

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    clap::Command::new("farmhand")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Node agent for distributed document processing")
}

/// Parse and execute CLI arguments
pub fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            server_url,
            node_id,
            work_dir,
            log_level,
        } => {
            let overrides = ConfigOverrides {
                server_url,
                node_id,
                work_dir,
                log_level,
            };
            run_agent(config.as_deref(), &overrides)?;
        }
        Command::CheckConfig { config } => {
            let loaded = AgentConfig::load(config.as_deref())?;
            loaded.validate()?;
            println!("{}", loaded.to_yaml()?);
        }
        Command::Capabilities => {
            for name in CapabilityRegistry::with_builtins().supported() {
                println!("{}", name);
            }
        }
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{}", completions);
            }
        }
    }

    Ok(())
}

/// Loads configuration, sets up logging and drives the agent runtime to
/// completion on a fresh tokio runtime.
fn run_agent(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<()> {
    let mut config = AgentConfig::load(config_path)?;
    config.apply_overrides(overrides);
    config.validate()?;

    // Dropped on exit; keeps the file appender flushing until then.
    let _log_guard = init_logging(&config.agent.logging.level, config.agent.logging.file.as_deref())
        .context("Failed to initialise logging")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let agent = AgentRuntime::from_config(&config)?;
        agent.install_signal_handler()?;
        agent.run().await;
        Ok::<(), farmhand::agent::RuntimeError>(())
    })?;

    Ok(())
}
