use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use stepflow::demo::{self, DemoServices};
use stepflow::Stepflow;

use super::{init_tracing, load_config};

/// Run the gateway and workers.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "stepflow.toml")]
    pub config: String,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to (overrides config).
    #[arg(long)]
    pub host: Option<String>,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let mut config = load_config(&self.config)?;
        init_tracing(&config.observability.logging, self.verbose);

        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(host) = self.host {
            config.gateway.host = host;
        }

        println!();
        println!(
            "  {}  v{}",
            style("STEPFLOW").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();
        println!(
            "  {} Listening on {}",
            style("→").bold(),
            style(format!("http://{}", config.gateway.bind_addr())).cyan()
        );
        println!(
            "  {} Store: {}",
            style("→").bold(),
            if config.database.is_persistent() {
                "postgres"
            } else {
                "in-memory"
            }
        );
        println!();

        info!("Loaded configuration from {}", self.config);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        let stepflow = demo::register(
            Stepflow::builder().config(config),
            DemoServices::from_env(client),
        )
        .build()
        .await?;

        stepflow.run().await?;

        println!("\n  {} Stopped", style("✓").green().bold());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_overrides() {
        let cmd = RunCommand::try_parse_from(["run", "-c", "custom.toml", "-p", "3000", "--host", "127.0.0.1"])
            .unwrap();
        assert_eq!(cmd.config, "custom.toml");
        assert_eq!(cmd.port, Some(3000));
        assert_eq!(cmd.host.as_deref(), Some("127.0.0.1"));
        assert!(!cmd.verbose);
    }
}
