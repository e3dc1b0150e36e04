use anyhow::{Context, Result};
use clap::Parser;
use console::style;

use stepflow::prelude::{NewEvent, PublishAck};

/// Publish an event to a running gateway.
#[derive(Parser)]
pub struct PublishCommand {
    /// Event name, e.g. `demo/generate`.
    pub name: String,

    /// Event payload as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// Idempotency ID; redelivering the same ID never creates a second run.
    #[arg(long)]
    pub id: Option<String>,

    /// Gateway base URL.
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "STEPFLOW_URL")]
    pub url: String,
}

impl PublishCommand {
    pub fn event(&self) -> Result<NewEvent> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.data).context("--data is not valid JSON")?;
        let mut event = NewEvent::new(&self.name, payload);
        if let Some(id) = &self.id {
            event = event.with_id(id);
        }
        Ok(event)
    }

    pub async fn execute(self) -> Result<()> {
        let event = self.event()?;
        let endpoint = format!("{}/events", self.url.trim_end_matches('/'));

        let response = reqwest::Client::new()
            .post(&endpoint)
            .json(&event)
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gateway rejected the event ({}): {}", status, body);
        }

        let ack: PublishAck = response.json().await?;
        println!(
            "  {} Event {}{}",
            style("✓").green().bold(),
            style(&ack.event_id).cyan(),
            if ack.duplicate { " (duplicate)" } else { "" }
        );
        if ack.runs.is_empty() {
            println!("  {} No workflow listens to {}", style("!").yellow(), self.name);
        }
        for run in &ack.runs {
            println!("    run {}", run);
        }

        Ok(())
    }
}
