mod demo;
mod publish;
mod run;

pub use demo::DemoCommand;
pub use publish::PublishCommand;
pub use run::RunCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stepflow::prelude::StepflowConfig;
use stepflow::stepflow_core::config::LoggingConfig;

/// STEPFLOW - durable, event-triggered background workflows
#[derive(Parser)]
#[command(name = "stepflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway and workers.
    Run(RunCommand),

    /// Publish an event to a running gateway.
    Publish(PublishCommand),

    /// Run a demo event in-process and print the run status.
    Demo(DemoCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Publish(cmd) => cmd.execute().await,
            Commands::Demo(cmd) => cmd.execute().await,
        }
    }
}

/// Load the config file, or defaults when it does not exist.
fn load_config(path: &str) -> Result<StepflowConfig> {
    if Path::new(path).exists() {
        Ok(StepflowConfig::from_file(path)?)
    } else {
        Ok(StepflowConfig::default())
    }
}

/// Initialize tracing. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from(["stepflow", "run"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_publish() {
        let cli = Cli::try_parse_from([
            "stepflow",
            "publish",
            "demo/generate",
            "--data",
            r#"{"prompt":"hi"}"#,
            "--id",
            "evt-1",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_demo() {
        let cli = Cli::try_parse_from(["stepflow", "demo", "error"]);
        assert!(cli.is_ok());
        assert!(Cli::try_parse_from(["stepflow", "demo", "unknown"]).is_err());
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config("does-not-exist.toml").unwrap();
        assert!(!config.database.is_persistent());
        assert_eq!(config.gateway.port, 8080);
    }
}
