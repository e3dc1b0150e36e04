use anyhow::Result;
use clap::{Parser, ValueEnum};
use console::style;

use stepflow::demo::{self, DemoServices};
use stepflow::prelude::{NewEvent, RunStatus, StepflowConfig};
use stepflow::Stepflow;

use super::init_tracing;

/// Which demo event to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoKind {
    /// `demo/generate`
    Generate,
    /// `demo/error`
    Error,
    /// `github/import.repository`
    Import,
}

/// Run a demo event in-process and print the run status.
#[derive(Parser)]
pub struct DemoCommand {
    /// Demo to run.
    #[arg(value_enum)]
    pub kind: DemoKind,

    /// Prompt for the generate demo.
    #[arg(long, default_value = "Explain https://example.com")]
    pub prompt: String,

    /// Repository for the import demo.
    #[arg(long, default_value = "https://github.com/rust-lang/rustlings")]
    pub repo_url: String,

    /// Project receiving imported files.
    #[arg(long, default_value = "demo-project")]
    pub project_id: String,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl DemoCommand {
    pub fn event(&self) -> NewEvent {
        match self.kind {
            DemoKind::Generate => NewEvent::new(
                "demo/generate",
                serde_json::json!({ "prompt": self.prompt }),
            ),
            DemoKind::Error => NewEvent::new("demo/error", serde_json::json!({})),
            DemoKind::Import => NewEvent::new(
                "github/import.repository",
                serde_json::json!({ "repoUrl": self.repo_url, "projectId": self.project_id }),
            ),
        }
    }

    pub async fn execute(self) -> Result<()> {
        let config = StepflowConfig::default();
        init_tracing(&config.observability.logging, self.verbose);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        let stepflow = demo::register(
            Stepflow::builder().config(config),
            DemoServices::from_env(client),
        )
        .build()
        .await?;

        let ack = stepflow.publish(self.event()).await?;
        for run_id in ack.runs {
            stepflow.executor().execute(run_id).await?;
            let report = stepflow.run_status(run_id).await?;

            let status = match report.status {
                RunStatus::Succeeded => style(report.status.as_str()).green().bold(),
                RunStatus::Failed => style(report.status.as_str()).red().bold(),
                _ => style(report.status.as_str()).yellow(),
            };
            println!();
            println!("  {} {} {}", style(&report.workflow_id).cyan(), run_id, status);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Ok(())
    }
}
