use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::collaborators::{NewFile, RecordSink, RepoRef, RepositorySource, TreeEntry};
use stepflow_core::workflow::{Workflow, WorkflowContext, WorkflowInfo};
use stepflow_core::Result;

/// Imports every file of a repository into a project.
///
/// The tree is fetched once (`fetch-repo-files`), then each blob becomes its
/// own `create-file:<path>` step. A run restarted part way through skips the
/// files that were already created.
pub struct ImportRepository;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportInput {
    pub repo_url: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutput {
    pub files: usize,
    pub body: String,
}

impl Workflow for ImportRepository {
    type Payload = ImportInput;
    type Output = ImportOutput;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("import-repository", "github/import.repository")
    }

    fn execute(
        ctx: &WorkflowContext,
        payload: Self::Payload,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + '_>> {
        Box::pin(import(ctx, payload))
    }
}

/// Name of the step creating the record for `path`.
pub fn create_file_step(path: &str) -> String {
    format!("create-file:{}", path)
}

async fn import(ctx: &WorkflowContext, input: ImportInput) -> Result<ImportOutput> {
    let source = ctx.service::<Arc<dyn RepositorySource>>()?;
    let sink = ctx.service::<Arc<dyn RecordSink>>()?;
    let source = source.as_ref();
    let sink = sink.as_ref();

    let repo = RepoRef::parse(&input.repo_url)?;
    let repo = &repo;
    let entries: Vec<TreeEntry> = ctx
        .run_step("fetch-repo-files", || async move { source.tree(repo).await })
        .await?;

    let project_id = input.project_id.as_str();
    let mut files = 0;

    for entry in entries.iter().filter(|e| e.is_blob()) {
        ctx.run_step::<(), _, _>(&create_file_step(&entry.path), || async move {
            let content = source.blob(repo, &entry.sha).await?;
            let file = NewFile {
                project_id: project_id.to_string(),
                name: entry.path.clone(),
                content,
            };
            sink.create_file(&file).await
        })
        .await?;
        files += 1;
    }

    tracing::info!(run_id = %ctx.run_id, repo = %repo, files, "Repository imported");

    Ok(ImportOutput {
        files,
        body: "Repository imported!".to_string(),
    })
}
