//! Collaborator clients called from demo step bodies.
//!
//! Each collaborator is an object-safe trait so workflows can look it up from
//! the execution context as `Arc<dyn Trait>`. HTTP implementations live in
//! [`super::http`]; the in-process ones here back the CLI demo and tests.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use stepflow_core::StepError;

/// Produces text for a prompt.
pub trait TextGenerator: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, StepError>>;
}

/// Extracts the main content of a web page as markdown.
pub trait WebScraper: Send + Sync {
    /// `Ok(None)` when the page has no extractable content.
    fn scrape<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, StepError>>;
}

/// Read access to a hosted source repository.
pub trait RepositorySource: Send + Sync {
    /// Recursive tree of the default branch.
    fn tree<'a>(&'a self, repo: &'a RepoRef) -> BoxFuture<'a, Result<Vec<TreeEntry>, StepError>>;

    /// Decoded UTF-8 content of a blob.
    fn blob<'a>(
        &'a self,
        repo: &'a RepoRef,
        sha: &'a str,
    ) -> BoxFuture<'a, Result<String, StepError>>;
}

/// Persistent record storage for imported files.
pub trait RecordSink: Send + Sync {
    fn create_file<'a>(&'a self, file: &'a NewFile) -> BoxFuture<'a, Result<(), StepError>>;
}

/// Owner and name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parse `https://github.com/<owner>/<repo>`; the scheme is optional.
    pub fn parse(url: &str) -> Result<Self, StepError> {
        let invalid = || StepError::validation(format!("'{}' is not a GitHub repository URL", url));

        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
        if !matches!(host.to_ascii_lowercase().as_str(), "github.com" | "www.github.com") {
            return Err(invalid());
        }

        let mut parts = path.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next()) {
            (Some(owner), Some(repo)) => Ok(Self::new(owner, repo.trim_end_matches(".git"))),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// One entry of a repository tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    /// `blob`, `tree` or `commit`.
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

impl TreeEntry {
    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

/// A file record to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub project_id: String,
    pub name: String,
    pub content: String,
}

/// Generator that answers with the prompt itself.
#[derive(Debug, Default, Clone)]
pub struct EchoGenerator;

impl TextGenerator for EchoGenerator {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, StepError>> {
        Box::pin(async move { Ok(prompt.to_string()) })
    }
}

/// Scraper serving fixed pages.
#[derive(Debug, Default)]
pub struct StaticScraper {
    pages: HashMap<String, String>,
}

impl StaticScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, markdown: impl Into<String>) -> Self {
        self.pages.insert(url.into(), markdown.into());
        self
    }
}

impl WebScraper for StaticScraper {
    fn scrape<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, StepError>> {
        Box::pin(async move { Ok(self.pages.get(url).cloned()) })
    }
}

/// Repository source backed by in-memory file contents.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    repos: HashMap<RepoRef, Vec<(String, String)>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(
        mut self,
        repo: &RepoRef,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.repos
            .entry(repo.clone())
            .or_default()
            .push((path.into(), content.into()));
        self
    }
}

impl RepositorySource for MemoryRepository {
    fn tree<'a>(&'a self, repo: &'a RepoRef) -> BoxFuture<'a, Result<Vec<TreeEntry>, StepError>> {
        Box::pin(async move {
            let files = self
                .repos
                .get(repo)
                .ok_or_else(|| StepError::validation(format!("repository {} not found", repo)))?;

            let mut entries = Vec::new();
            let mut dirs: Vec<&str> = Vec::new();
            for (index, (path, _)) in files.iter().enumerate() {
                if let Some((dir, _)) = path.rsplit_once('/') {
                    if !dirs.contains(&dir) {
                        dirs.push(dir);
                        entries.push(TreeEntry {
                            path: dir.to_string(),
                            kind: "tree".to_string(),
                            sha: format!("tree-{}", dirs.len()),
                        });
                    }
                }
                entries.push(TreeEntry {
                    path: path.clone(),
                    kind: "blob".to_string(),
                    sha: index.to_string(),
                });
            }
            Ok(entries)
        })
    }

    fn blob<'a>(
        &'a self,
        repo: &'a RepoRef,
        sha: &'a str,
    ) -> BoxFuture<'a, Result<String, StepError>> {
        Box::pin(async move {
            self.repos
                .get(repo)
                .and_then(|files| sha.parse::<usize>().ok().and_then(|i| files.get(i)))
                .map(|(_, content)| content.clone())
                .ok_or_else(|| StepError::validation(format!("blob {} not found in {}", sha, repo)))
        })
    }
}

/// Sink that keeps created files in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    files: Mutex<Vec<NewFile>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files created so far, in creation order.
    pub async fn files(&self) -> Vec<NewFile> {
        self.files.lock().await.clone()
    }
}

impl RecordSink for MemoryRecordSink {
    fn create_file<'a>(&'a self, file: &'a NewFile) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            tracing::debug!(project_id = %file.project_id, name = %file.name, "Creating file record");
            self.files.lock().await.push(file.clone());
            Ok(())
        })
    }
}
