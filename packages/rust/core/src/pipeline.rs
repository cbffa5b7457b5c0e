//! Document entry points: one HTML file → artifacts, or a directory of them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use specextract_artifacts::{ArtifactKind, ArtifactRecord};
use specextract_shared::{Result, SpecExtractError};

use crate::engine::Workflow;
use crate::graph::GraphMode;
use crate::observe::WorkflowEvent;
use crate::state::PipelineState;
use crate::swarm::RefinementSummary;

/// Result of one successful document run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub input: PathBuf,
    pub output_key: String,
    pub model: String,
    pub mode: GraphMode,
    pub artifacts: Vec<ArtifactRecord>,
    pub refinement: Option<RefinementSummary>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Number of extracted items, if the item list was written.
    pub fn item_count(&self) -> Option<usize> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Items)
            .and_then(|a| a.item_count)
    }
}

/// Outcome for one document of a batch.
#[derive(Debug)]
pub struct DocumentResult {
    pub input: PathBuf,
    pub outcome: Result<RunReport>,
}

/// Results of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub documents: Vec<DocumentResult>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.documents.len() - self.succeeded()
    }
}

/// Logical document name: the file stem.
pub fn document_stem(input: &Path) -> Result<String> {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            SpecExtractError::Workflow(format!("cannot derive a document name from {}", input.display()))
        })
}

/// Run the workflow over one HTML file.
#[instrument(skip_all, fields(input = %input.display(), mode = %workflow.mode()))]
pub async fn process_document(
    workflow: &Workflow,
    input: &Path,
    output_root: &Path,
) -> Result<RunReport> {
    let start = Instant::now();
    let output_key = document_stem(input)?;
    let markup = tokio::fs::read_to_string(input)
        .await
        .map_err(|e| SpecExtractError::io(input, e))?;

    let state = PipelineState::new(markup, output_root, &output_key);
    let run_id = state.run_id;
    let observer = workflow.observer();

    info!(%run_id, key = %output_key, "processing document");
    observer.on_event(&WorkflowEvent::RunStarted {
        run_id,
        document: output_key.clone(),
        mode: workflow.mode(),
        model: workflow.model().to_string(),
    });

    let result = workflow.run(state).await;

    observer.on_event(&WorkflowEvent::RunFinished {
        run_id,
        document: output_key.clone(),
        elapsed: start.elapsed(),
        error: result.as_ref().err().map(|e| e.to_string()),
    });

    let state = result?;
    Ok(RunReport {
        run_id,
        input: input.to_path_buf(),
        output_key,
        model: workflow.model().to_string(),
        mode: workflow.mode(),
        artifacts: state.artifacts,
        refinement: state.refinement,
        elapsed: start.elapsed(),
    })
}

/// Run many documents with at most `jobs` in flight. A failing document
/// never stops the others.
#[instrument(skip_all, fields(documents = inputs.len(), jobs))]
pub async fn process_batch(
    workflow: Arc<Workflow>,
    inputs: Vec<PathBuf>,
    output_root: &Path,
    jobs: usize,
) -> BatchReport {
    let start = Instant::now();
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks: JoinSet<(usize, DocumentResult)> = JoinSet::new();
    let mut pending: Vec<Option<PathBuf>> = inputs.iter().cloned().map(Some).collect();

    for (index, input) in inputs.into_iter().enumerate() {
        let workflow = workflow.clone();
        let semaphore = semaphore.clone();
        let output_root = output_root.to_path_buf();

        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => process_document(&workflow, &input, &output_root).await,
                Err(e) => Err(SpecExtractError::Workflow(format!("batch scheduler closed: {e}"))),
            };
            (index, DocumentResult { input, outcome })
        });
    }

    let mut results: Vec<(usize, DocumentResult)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                if let Err(e) = &result.1.outcome {
                    warn!(input = %result.1.input.display(), kind = e.kind(), error = %e, "document failed");
                }
                pending[result.0] = None;
                results.push(result);
            }
            Err(e) => warn!(error = %e, "document task aborted"),
        }
    }

    // Aborted tasks never report back; their documents still count as failed.
    for (index, input) in pending.into_iter().enumerate() {
        if let Some(input) = input {
            results.push((
                index,
                DocumentResult {
                    input,
                    outcome: Err(SpecExtractError::Workflow("document task aborted".into())),
                },
            ));
        }
    }
    results.sort_by_key(|(index, _)| *index);

    let report = BatchReport {
        documents: results.into_iter().map(|(_, r)| r).collect(),
        elapsed: start.elapsed(),
    };
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "batch finished"
    );
    report
}

/// All `*.html` / `*.htm` files directly inside `dir`, sorted by name.
pub fn collect_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| SpecExtractError::io(dir, e))?;
    let mut inputs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| SpecExtractError::io(dir, e))?.path();
        let is_html = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"));
        if is_html && path.is_file() {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use specextract_llm::{Completion, CompletionRequest, Oracles, TextOracle};

    use crate::observe::Observer;

    /// Answers by looking at which stage is asking, so concurrent runs stay
    /// deterministic.
    struct RoutingOracle;

    #[async_trait]
    impl TextOracle for RoutingOracle {
        fn model(&self) -> &str {
            "router"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            let prompt = &request.messages[0].content;
            let answer = if prompt.starts_with("Check if") {
                if prompt.contains("invoice") {
                    r#"{"is_valid": false}"#.to_string()
                } else {
                    r#"{"is_valid": true}"#.to_string()
                }
            } else if prompt.starts_with("Convert") {
                "```markdown\nHeading\n```".to_string()
            } else {
                r#"[{"Наименование": "Heading", "Количество": "3"}]"#.to_string()
            };
            Ok(Completion::text(answer))
        }
    }

    fn workflow() -> Arc<Workflow> {
        Arc::new(
            Workflow::builder(Oracles::from_text(Arc::new(RoutingOracle)))
                .build()
                .unwrap(),
        )
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("se_pipeline_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn single_document_report() {
        let dir = temp_dir();
        let input = dir.join("tender-7.html");
        std::fs::write(&input, "<h1>Heading</h1>").unwrap();
        let out = dir.join("out");

        let report = process_document(&workflow(), &input, &out).await.unwrap();

        assert_eq!(report.output_key, "tender-7");
        assert_eq!(report.model, "router");
        assert_eq!(report.mode, GraphMode::Direct);
        assert_eq!(report.item_count(), Some(1));
        assert!(report.refinement.is_none());
        assert!(out.join("md/router/tender-7.md").exists());
        assert!(out.join("items/router/tender-7.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_input_is_io_error() {
        let dir = temp_dir();
        let err = process_document(&workflow(), &dir.join("absent.html"), &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, SpecExtractError::Io { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let dir = temp_dir();
        std::fs::write(dir.join("a.html"), "<p>spec</p>").unwrap();
        std::fs::write(dir.join("b.html"), "<p>invoice</p>").unwrap();
        std::fs::write(dir.join("c.HTM"), "<p>spec</p>").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        let out = dir.join("out");

        let inputs = collect_inputs(&dir).unwrap();
        assert_eq!(inputs.len(), 3);

        let report = process_batch(workflow(), inputs, &out, 2).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.documents[0].input.ends_with("a.html"));
        assert!(matches!(
            report.documents[1].outcome,
            Err(SpecExtractError::NotATargetDocument { .. })
        ));
        assert!(!out.join("md/router/b.md").exists());
        assert!(out.join("items/router/c.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Panics while announcing one particular document.
    struct PanickingObserver;

    impl Observer for PanickingObserver {
        fn on_event(&self, event: &WorkflowEvent) {
            if let WorkflowEvent::RunStarted { document, .. } = event {
                if document == "broken" {
                    panic!("observer failure");
                }
            }
        }
    }

    #[tokio::test]
    async fn batch_counts_aborted_documents_as_failed() {
        let dir = temp_dir();
        std::fs::write(dir.join("broken.html"), "<p>spec</p>").unwrap();
        std::fs::write(dir.join("fine.html"), "<p>spec</p>").unwrap();
        let out = dir.join("out");

        let workflow = Arc::new(
            Workflow::builder(Oracles::from_text(Arc::new(RoutingOracle)))
                .observer(Arc::new(PanickingObserver))
                .build()
                .unwrap(),
        );
        let inputs = collect_inputs(&dir).unwrap();
        let report = process_batch(workflow, inputs, &out, 2).await;

        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.documents[0].input.ends_with("broken.html"));
        assert!(matches!(
            report.documents[0].outcome,
            Err(SpecExtractError::Workflow(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stem_from_path() {
        assert_eq!(document_stem(Path::new("/x/ТЗ насосы.html")).unwrap(), "ТЗ насосы");
        assert!(document_stem(Path::new("/")).is_err());
    }
}
