//! Demo workflows and their collaborator clients.
//!
//! | Workflow            | Trigger                    |
//! |---------------------|----------------------------|
//! | `demo-generate`     | `demo/generate`            |
//! | `demo-error`        | `demo/error`               |
//! | `import-repository` | `github/import.repository` |

mod collaborators;
mod failing;
mod generate;
mod http;
mod import;

pub use collaborators::{
    EchoGenerator, MemoryRecordSink, MemoryRepository, NewFile, RecordSink, RepoRef,
    RepositorySource, StaticScraper, TextGenerator, TreeEntry, WebScraper,
};
pub use failing::DemoError;
pub use generate::{compose_prompt, extract_urls, DemoGenerate, GenerateInput, GenerateOutput};
pub use http::{
    classify_status, AnthropicGenerator, FirecrawlScraper, GitHubSource, HttpRecordSink,
};
pub use import::{create_file_step, ImportInput, ImportOutput, ImportRepository};

use std::sync::Arc;

use crate::runtime::StepflowBuilder;

const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";

/// Collaborator clients used by the demo workflows.
#[derive(Clone)]
pub struct DemoServices {
    pub generator: Arc<dyn TextGenerator>,
    pub scraper: Arc<dyn WebScraper>,
    pub repositories: Arc<dyn RepositorySource>,
    pub records: Arc<dyn RecordSink>,
}

impl DemoServices {
    /// In-process collaborators only.
    pub fn in_memory() -> Self {
        Self {
            generator: Arc::new(EchoGenerator),
            scraper: Arc::new(StaticScraper::new()),
            repositories: Arc::new(MemoryRepository::new()),
            records: Arc::new(MemoryRecordSink::new()),
        }
    }

    /// HTTP collaborators for every service configured in the environment.
    ///
    /// | Variable            | Client                          |
    /// |---------------------|---------------------------------|
    /// | `ANTHROPIC_API_KEY` | [`AnthropicGenerator`]          |
    /// | `ANTHROPIC_MODEL`   | model override                  |
    /// | `FIRECRAWL_API_KEY` | [`FirecrawlScraper`]            |
    /// | `GITHUB_TOKEN`      | token for [`GitHubSource`]      |
    /// | `RECORDS_ENDPOINT`  | [`HttpRecordSink`]              |
    ///
    /// Unset services fall back to the in-process clients, except the
    /// repository source which always talks to GitHub.
    pub fn from_env(client: reqwest::Client) -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let fallback = Self::in_memory();

        let generator: Arc<dyn TextGenerator> = match env("ANTHROPIC_API_KEY") {
            Some(key) => {
                let model = env("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
                Arc::new(AnthropicGenerator::new(client.clone(), key, model))
            }
            None => {
                tracing::info!("ANTHROPIC_API_KEY not set, using the echo generator");
                fallback.generator
            }
        };

        let scraper: Arc<dyn WebScraper> = match env("FIRECRAWL_API_KEY") {
            Some(key) => Arc::new(FirecrawlScraper::new(client.clone(), key)),
            None => {
                tracing::info!("FIRECRAWL_API_KEY not set, scraping disabled");
                fallback.scraper
            }
        };

        let records: Arc<dyn RecordSink> = match env("RECORDS_ENDPOINT") {
            Some(endpoint) => Arc::new(HttpRecordSink::new(client.clone(), endpoint)),
            None => fallback.records,
        };

        Self {
            generator,
            scraper,
            repositories: Arc::new(GitHubSource::new(client, env("GITHUB_TOKEN"))),
            records,
        }
    }
}

/// Register the demo workflows and their services.
pub fn register(builder: StepflowBuilder, services: DemoServices) -> StepflowBuilder {
    builder
        .register::<DemoGenerate>()
        .register::<DemoError>()
        .register::<ImportRepository>()
        .service(services.generator)
        .service(services.scraper)
        .service(services.repositories)
        .service(services.records)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use uuid::Uuid;

    use super::*;
    use crate::runtime::Stepflow;
    use stepflow_core::workflow::RunStatusReport;
    use stepflow_core::{ErrorKind, NewEvent, RunStatus, StepError, StepStatus, StepflowConfig};

    fn fast_config() -> StepflowConfig {
        let mut config = StepflowConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.retry.jitter = 0.0;
        config
    }

    async fn demo_runtime(services: DemoServices) -> Stepflow {
        register(Stepflow::builder().config(fast_config()), services)
            .build()
            .await
            .unwrap()
    }

    async fn publish_and_execute(stepflow: &Stepflow, event: NewEvent) -> RunStatusReport {
        let ack = stepflow.publish(event).await.unwrap();
        assert_eq!(ack.runs.len(), 1);
        stepflow.executor().execute(ack.runs[0]).await.unwrap();
        stepflow.run_status(ack.runs[0]).await.unwrap()
    }

    /// Fails transiently a set number of times, then serves a page.
    struct FlakyScraper {
        failures: u32,
        calls: AtomicU32,
    }

    impl WebScraper for FlakyScraper {
        fn scrape<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Option<String>, StepError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= self.failures {
                    Err(StepError::network("connection reset"))
                } else {
                    Ok(Some("# Example Domain".to_string()))
                }
            })
        }
    }

    #[derive(Default)]
    struct CountingGenerator {
        prompts: tokio::sync::Mutex<Vec<String>>,
    }

    impl TextGenerator for CountingGenerator {
        fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, StepError>> {
            Box::pin(async move {
                self.prompts.lock().await.push(prompt.to_string());
                Ok("an answer".to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_generate_retries_scrape_and_generates_once() {
        let scraper = Arc::new(FlakyScraper {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let generator = Arc::new(CountingGenerator::default());
        let stepflow = demo_runtime(DemoServices {
            generator: generator.clone(),
            scraper: scraper.clone(),
            ..DemoServices::in_memory()
        })
        .await;

        let report = publish_and_execute(
            &stepflow,
            NewEvent::new(
                "demo/generate",
                serde_json::json!({"prompt": "Explain https://example.com"}),
            ),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.step_history.len(), 3);

        let urls = report.step("extract-urls").unwrap();
        assert_eq!(urls.result, Some(serde_json::json!(["https://example.com"])));

        let scrape = report.step("scrape-urls").unwrap();
        assert_eq!(scrape.status, StepStatus::Succeeded);
        assert_eq!(scrape.attempt_count, 3);
        assert_eq!(scrape.history.len(), 2);
        assert!(scrape.history.iter().all(|f| f.kind == ErrorKind::Network));

        let generate = report.step("generate-text").unwrap();
        assert_eq!(generate.attempt_count, 1);
        let prompts = generator.prompts.lock().await.clone();
        assert_eq!(
            prompts,
            vec!["Context:\n# Example Domain\n\nQuestion: Explain https://example.com"]
        );

        let output: GenerateOutput = serde_json::from_value(report.result.unwrap()).unwrap();
        assert_eq!(output.text, "an answer");
    }

    #[tokio::test]
    async fn test_generate_without_urls_uses_bare_prompt() {
        let stepflow = demo_runtime(DemoServices::in_memory()).await;

        let report = publish_and_execute(
            &stepflow,
            NewEvent::new("demo/generate", serde_json::json!({"prompt": "Say hi"})),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        let output: GenerateOutput = serde_json::from_value(report.result.unwrap()).unwrap();
        assert!(output.urls.is_empty());
        assert_eq!(output.text, "Say hi");
    }

    #[tokio::test]
    async fn test_error_workflow_fails_after_one_attempt() {
        let stepflow = demo_runtime(DemoServices::in_memory()).await;

        let report = publish_and_execute(
            &stepflow,
            NewEvent::new("demo/error", serde_json::Value::Null),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        let step = report.step("fail").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempt_count, 1);

        let error = report.error.unwrap();
        assert_eq!(error.step.as_deref(), Some("fail"));
        assert_eq!(error.attempts, 1);
        assert!(error.message.contains("Background job failed!"));
    }

    /// Records files, hanging forever on the first attempt to create file `block_at`.
    struct BlockingSink {
        inner: MemoryRecordSink,
        block_at: usize,
        blocked: AtomicBool,
        attempts: AtomicU32,
    }

    impl RecordSink for BlockingSink {
        fn create_file<'a>(&'a self, file: &'a NewFile) -> BoxFuture<'a, Result<(), StepError>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if self.inner.files().await.len() + 1 == self.block_at
                    && !self.blocked.swap(true, Ordering::SeqCst)
                {
                    std::future::pending::<()>().await;
                }
                self.inner.create_file(file).await
            })
        }
    }

    fn five_file_repo(repo: &RepoRef) -> MemoryRepository {
        (1..=5).fold(MemoryRepository::new(), |source, i| {
            source.with_file(repo, format!("src/file{}.rs", i), format!("// file {}", i))
        })
    }

    async fn wait_for_attempts(sink: &BlockingSink, attempts: u32) {
        for _ in 0..400 {
            if sink.attempts.load(Ordering::SeqCst) >= attempts {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sink never saw {attempts} attempts");
    }

    #[tokio::test]
    async fn test_import_resumes_without_duplicating_records() {
        let repo = RepoRef::new("acme", "site");
        let sink = Arc::new(BlockingSink {
            inner: MemoryRecordSink::new(),
            block_at: 4,
            blocked: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        });
        let stepflow = demo_runtime(DemoServices {
            repositories: Arc::new(five_file_repo(&repo)),
            records: sink.clone(),
            ..DemoServices::in_memory()
        })
        .await;

        let ack = stepflow
            .publish(NewEvent::new(
                "github/import.repository",
                serde_json::json!({
                    "repoUrl": "https://github.com/acme/site",
                    "projectId": "proj-1"
                }),
            ))
            .await
            .unwrap();
        let run_id: Uuid = ack.runs[0];

        // First execution stalls on the 4th file; kill it as a crash would.
        let executor = stepflow.executor();
        let first = tokio::spawn(async move { executor.execute(run_id).await });
        wait_for_attempts(&sink, 4).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let interrupted = stepflow.run_status(run_id).await.unwrap();
        assert_eq!(interrupted.status, RunStatus::Running);
        assert_eq!(sink.inner.files().await.len(), 3);

        let run = stepflow.executor().execute(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            run.result,
            Some(serde_json::json!({"files": 5, "body": "Repository imported!"}))
        );

        let files = sink.inner.files().await;
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "src/file1.rs",
                "src/file2.rs",
                "src/file3.rs",
                "src/file4.rs",
                "src/file5.rs"
            ]
        );
        assert!(files.iter().all(|f| f.project_id == "proj-1"));
        assert_eq!(files[4].content, "// file 5");

        let report = stepflow.run_status(run_id).await.unwrap();
        assert_eq!(report.step("fetch-repo-files").unwrap().attempt_count, 1);
        for i in 1..=3 {
            let step = report.step(&create_file_step(&format!("src/file{}.rs", i))).unwrap();
            assert_eq!(step.attempt_count, 1);
        }
        // The 4th file's interrupted attempt counts, its replay is the second.
        let fourth = report.step(&create_file_step("src/file4.rs")).unwrap();
        assert_eq!(fourth.status, StepStatus::Succeeded);
        assert_eq!(fourth.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_import_rejects_bad_repository_url() {
        let stepflow = demo_runtime(DemoServices::in_memory()).await;

        let report = publish_and_execute(
            &stepflow,
            NewEvent::new(
                "github/import.repository",
                serde_json::json!({"repoUrl": "not-a-repo", "projectId": "p"}),
            ),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.step_history.is_empty());
    }
}
