use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::collaborators::{TextGenerator, WebScraper};
use stepflow_core::workflow::{ParallelGroup, Workflow, WorkflowContext, WorkflowInfo};
use stepflow_core::{Result, StepflowError};

/// Answers a prompt, using the content of any URLs it mentions as context.
///
/// Steps: `extract-urls`, `scrape-urls` (one concurrent scrape per URL, all
/// or nothing), `generate-text`.
pub struct DemoGenerate;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateInput {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub urls: Vec<String>,
    pub text: String,
}

impl Workflow for DemoGenerate {
    type Payload = GenerateInput;
    type Output = GenerateOutput;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("demo-generate", "demo/generate")
    }

    fn execute(
        ctx: &WorkflowContext,
        payload: Self::Payload,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + '_>> {
        Box::pin(generate(ctx, payload))
    }
}

async fn generate(ctx: &WorkflowContext, input: GenerateInput) -> Result<GenerateOutput> {
    let scraper = ctx.service::<Arc<dyn WebScraper>>()?;
    let generator = ctx.service::<Arc<dyn TextGenerator>>()?;

    let prompt = input.prompt.as_str();
    let urls: Vec<String> = ctx
        .run_step("extract-urls", || async move { Ok(extract_urls(prompt)) })
        .await?;

    let scraper = scraper.as_ref();
    let urls_ref = &urls;
    let scraped: String = ctx
        .run_step("scrape-urls", || async move {
            let group: ParallelGroup<'_, Option<String>> =
                urls_ref.iter().map(|url| scraper.scrape(url)).collect();
            group.join().await.map(join_scraped)
        })
        .await?;

    let final_prompt = compose_prompt(&scraped, prompt);
    let generator = generator.as_ref();
    let final_prompt = final_prompt.as_str();
    let text: String = ctx
        .run_step("generate-text", || async move {
            generator.generate(final_prompt).await
        })
        .await?;

    Ok(GenerateOutput { urls, text })
}

fn url_regex() -> Result<&'static Regex> {
    static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    URL_RE
        .get_or_init(|| Regex::new(r"https?://[^\s]+").ok())
        .as_ref()
        .ok_or_else(|| StepflowError::Internal("URL pattern failed to compile".into()))
}

/// Every `http(s)://` URL in `text`, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    match url_regex() {
        Ok(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Join scraped documents with a blank line, skipping pages without content.
pub fn join_scraped(pages: Vec<Option<String>>) -> String {
    pages
        .into_iter()
        .flatten()
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Prompt sent to the generator.
pub fn compose_prompt(scraped: &str, prompt: &str) -> String {
    if scraped.is_empty() {
        prompt.to_string()
    } else {
        format!("Context:\n{}\n\nQuestion: {}", scraped, prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_urls() {
        assert_eq!(
            extract_urls("Explain https://example.com"),
            vec!["https://example.com"]
        );
        assert_eq!(
            extract_urls("compare http://a.dev/x?y=1 and https://b.io\nplease"),
            vec!["http://a.dev/x?y=1", "https://b.io"]
        );
        assert!(extract_urls("no links here, ftp://nope").is_empty());
    }

    #[test]
    fn test_join_scraped_filters_empty_pages() {
        let joined = join_scraped(vec![
            Some("# One".to_string()),
            None,
            Some(String::new()),
            Some("# Two".to_string()),
        ]);
        assert_eq!(joined, "# One\n\n# Two");
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("", "Why?"), "Why?");
        assert_eq!(
            compose_prompt("# Page", "Why?"),
            "Context:\n# Page\n\nQuestion: Why?"
        );
    }
}
