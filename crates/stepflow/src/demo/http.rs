//! HTTP collaborator clients.
//!
//! Transport failures and error statuses are classified into [`ErrorKind`]s
//! so that the retry policy treats them consistently: timeouts and connection
//! errors are transient, so are `429` and `5xx`; any other `4xx` is permanent.

use base64::Engine;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;

use super::collaborators::{
    NewFile, RecordSink, RepoRef, RepositorySource, TextGenerator, TreeEntry, WebScraper,
};
use stepflow_core::{ErrorKind, StepError};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const FIRECRAWL_API_BASE: &str = "https://api.firecrawl.dev";
const GITHUB_API_BASE: &str = "https://api.github.com";

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::RateLimited
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ErrorKind::Timeout
    } else if status.is_server_error() {
        ErrorKind::Network
    } else {
        ErrorKind::Validation
    }
}

fn request_error(service: &str, e: reqwest::Error) -> StepError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorKind::Network
    } else if e.is_decode() {
        ErrorKind::MalformedInput
    } else if let Some(status) = e.status() {
        classify_status(status)
    } else {
        ErrorKind::Network
    };
    StepError::new(kind, format!("{} request failed: {}", service, e))
}

async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, StepError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(StepError::new(
        classify_status(status),
        format!("{} returned HTTP {}: {}", service, status, body),
    ))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    service: &str,
    response: reqwest::Response,
) -> Result<T, StepError> {
    let response = check_status(service, response).await?;
    response.json::<T>().await.map_err(|e| {
        StepError::malformed_input(format!("{} response could not be decoded: {}", service, e))
    })
}

/// Text generation through the Anthropic Messages API.
pub struct AnthropicGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicGenerator {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_BASE.to_string(),
            model: model.into(),
            max_tokens: 1024,
        }
    }

    /// Override the base URL (useful for proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    fn text(self) -> String {
        self.content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("")
    }
}

impl TextGenerator for AnthropicGenerator {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, StepError>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            });

            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| request_error("anthropic", e))?;

            let message: MessagesResponse = read_json("anthropic", response).await?;
            Ok(message.text())
        })
    }
}

/// Web content extraction through the Firecrawl scrape API.
pub struct FirecrawlScraper {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl FirecrawlScraper {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: FIRECRAWL_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    data: Option<ScrapeData>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
}

impl WebScraper for FirecrawlScraper {
    fn scrape<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, StepError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/v1/scrape", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({ "url": url, "formats": ["markdown"] }))
                .send()
                .await
                .map_err(|e| request_error("firecrawl", e))?;

            let scraped: ScrapeResponse = read_json("firecrawl", response).await?;
            Ok(scraped.data.and_then(|d| d.markdown))
        })
    }
}

/// Repository access through the GitHub REST API.
pub struct GitHubSource {
    client: reqwest::Client,
    token: Option<String>,
    base_url: String,
    branch: String,
}

impl GitHubSource {
    pub fn new(client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            client,
            token,
            base_url: GITHUB_API_BASE.to_string(),
            branch: "main".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn get(&self, path: String) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "stepflow");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitTree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct GitBlob {
    content: String,
    encoding: String,
}

/// Decode a blob payload as returned by the GitHub API.
fn decode_blob(blob: GitBlob) -> Result<String, StepError> {
    let bytes = match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob.content.split_whitespace().collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| StepError::malformed_input(format!("invalid blob encoding: {}", e)))?
        }
        _ => blob.content.into_bytes(),
    };
    String::from_utf8(bytes)
        .map_err(|e| StepError::malformed_input(format!("blob is not UTF-8: {}", e)))
}

impl RepositorySource for GitHubSource {
    fn tree<'a>(&'a self, repo: &'a RepoRef) -> BoxFuture<'a, Result<Vec<TreeEntry>, StepError>> {
        Box::pin(async move {
            let response = self
                .get(format!(
                    "/repos/{}/{}/git/ref/heads/{}",
                    repo.owner, repo.repo, self.branch
                ))
                .send()
                .await
                .map_err(|e| request_error("github", e))?;
            let head: GitRef = read_json("github", response).await?;

            let response = self
                .get(format!(
                    "/repos/{}/{}/git/trees/{}?recursive=true",
                    repo.owner, repo.repo, head.object.sha
                ))
                .send()
                .await
                .map_err(|e| request_error("github", e))?;
            let tree: GitTree = read_json("github", response).await?;

            if tree.truncated {
                tracing::warn!(repo = %repo, entries = tree.tree.len(), "Repository tree truncated");
            }
            Ok(tree.tree)
        })
    }

    fn blob<'a>(
        &'a self,
        repo: &'a RepoRef,
        sha: &'a str,
    ) -> BoxFuture<'a, Result<String, StepError>> {
        Box::pin(async move {
            let response = self
                .get(format!("/repos/{}/{}/git/blobs/{}", repo.owner, repo.repo, sha))
                .send()
                .await
                .map_err(|e| request_error("github", e))?;
            let blob: GitBlob = read_json("github", response).await?;
            decode_blob(blob)
        })
    }
}

/// Record sink posting each file to an HTTP endpoint.
pub struct HttpRecordSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecordSink {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

impl RecordSink for HttpRecordSink {
    fn create_file<'a>(&'a self, file: &'a NewFile) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(file)
                .send()
                .await
                .map_err(|e| request_error("records", e))?;
            check_status("records", response).await?;
            Ok(())
        })
    }
}
