//! Workflow engine: runs a [`StageGraph`] once per document.
//!
//! Every stage whose dependencies are done is spawned on a `JoinSet`, so the
//! persist branch and the refine/extract branch run side by side. After the
//! first failure nothing new is scheduled; stages already in flight are
//! drained and the first error is returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, instrument, warn};

use specextract_llm::Oracles;
use specextract_shared::{Result, RuntimeConfig, SpecExtractError};

use crate::checkpoint::Checkpointer;
use crate::graph::{GraphMode, StageGraph, StageId};
use crate::observe::{Observer, SilentObserver, WorkflowEvent};
use crate::stages::{self, StageContext};
use crate::state::{PipelineState, StateUpdate};
use crate::swarm::{DEFAULT_MAX_TURNS, Swarm};

/// A validated stage graph wired to its oracles.
pub struct Workflow {
    graph: StageGraph,
    ctx: Arc<StageContext>,
}

/// Builder for [`Workflow`].
pub struct WorkflowBuilder {
    oracles: Oracles,
    refine: bool,
    max_turns: u32,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    observer: Arc<dyn Observer>,
}

impl WorkflowBuilder {
    /// Pick the refined graph instead of the direct one.
    pub fn refine(mut self, refine: bool) -> Self {
        self.refine = refine;
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Apply the mode and turn budget from a resolved configuration.
    pub fn configure(self, config: &RuntimeConfig) -> Self {
        self.refine(config.refine).max_turns(config.max_refine_turns)
    }

    pub fn build(self) -> Result<Workflow> {
        if self.max_turns == 0 {
            return Err(SpecExtractError::config("max_refine_turns must be at least 1"));
        }

        let graph = StageGraph::for_mode(self.refine);
        graph.validate()?;

        let mut swarm = Swarm::new(self.oracles.text.clone(), self.max_turns)
            .with_observer(self.observer.clone());
        if let Some(checkpointer) = self.checkpointer {
            swarm = swarm.with_checkpointer(checkpointer);
        }

        Ok(Workflow {
            graph,
            ctx: Arc::new(StageContext {
                oracles: self.oracles,
                swarm,
                observer: self.observer,
            }),
        })
    }
}

type StageOutput = (StageId, Result<StateUpdate>, Duration);

impl Workflow {
    pub fn builder(oracles: Oracles) -> WorkflowBuilder {
        WorkflowBuilder {
            oracles,
            refine: false,
            max_turns: DEFAULT_MAX_TURNS,
            checkpointer: None,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn mode(&self) -> GraphMode {
        self.graph.mode()
    }

    /// Model id used to key artifacts.
    pub fn model(&self) -> &str {
        self.ctx.oracles.model()
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.ctx.observer
    }

    /// Execute every stage of the graph exactly once over `state`.
    #[instrument(skip_all, fields(run_id = %state.run_id, key = %state.output_key, mode = %self.graph.mode()))]
    pub async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let run_id = state.run_id;
        let mut started: HashSet<StageId> = HashSet::new();
        let mut done: HashSet<StageId> = HashSet::new();
        let mut tasks: JoinSet<StageOutput> = JoinSet::new();
        let mut first_error: Option<SpecExtractError> = None;

        loop {
            if first_error.is_none() {
                for id in self.graph.ready(&done, &started) {
                    started.insert(id);
                    self.ctx
                        .observer
                        .on_event(&WorkflowEvent::StageStarted { run_id, stage: id });
                    debug!(stage = %id, "scheduling stage");

                    let ctx = self.ctx.clone();
                    let snapshot = state.clone();
                    tasks.spawn(
                        async move {
                            let start = Instant::now();
                            let result = stages::run_stage(id, &ctx, &snapshot).await;
                            (id, result, start.elapsed())
                        }
                        .in_current_span(),
                    );
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let (id, result, elapsed) = match joined {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "stage task aborted");
                    if first_error.is_none() {
                        first_error = Some(SpecExtractError::Workflow(format!("stage task failed: {e}")));
                    }
                    continue;
                }
            };

            let outcome = result.and_then(|update| state.apply(update));
            self.ctx.observer.on_event(&WorkflowEvent::StageFinished {
                run_id,
                stage: id,
                elapsed,
                error: outcome.as_ref().err().map(|e| e.to_string()),
            });

            match outcome {
                Ok(()) => {
                    debug!(stage = %id, elapsed_ms = elapsed.as_millis() as u64, "stage finished");
                    done.insert(id);
                }
                Err(e) => {
                    warn!(stage = %id, kind = e.kind(), error = %e, "stage failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if done.len() != self.graph.len() {
            return Err(SpecExtractError::Workflow(format!(
                "run stalled after {} of {} stages",
                done.len(),
                self.graph.len()
            )));
        }

        info!(artifacts = state.artifacts.len(), "workflow finished");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::observe::RecordingObserver;
    use crate::swarm::{RefinementStatus, TRANSFER_TO_EXTRACTOR, TRANSFER_TO_REVIEWER};
    use specextract_llm::testing::ScriptedOracle;
    use std::path::{Path, PathBuf};
    use uuid::Uuid;

    const VALID: &str = r#"{"is_valid": true}"#;
    const INVALID: &str = r#"{"is_valid": false}"#;
    const CONVERTED: &str = "Here you go:\n```markdown\nHeading\n```";
    const ITEMS: &str = r#"[{"Наименование": "Heading"}]"#;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("se_engine_{}", Uuid::now_v7()))
    }

    fn workflow(oracle: &Arc<ScriptedOracle>, refine: bool) -> Workflow {
        Workflow::builder(Oracles::from_text(oracle.clone()))
            .refine(refine)
            .max_turns(6)
            .build()
            .unwrap()
    }

    fn items_json(root: &Path) -> serde_json::Value {
        let text = std::fs::read_to_string(root.join("items/m/spec.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn direct_mode_writes_both_artifacts() {
        let root = temp_root();
        let oracle = Arc::new(
            ScriptedOracle::new("m")
                .with_text(VALID)
                .with_text(CONVERTED)
                .with_text(ITEMS),
        );

        let state = workflow(&oracle, false)
            .run(PipelineState::new("<h1>Heading</h1>", &root, "spec"))
            .await
            .unwrap();

        assert_eq!(state.intermediate_text.as_deref(), Some("Heading"));
        assert!(state.refined_text.is_none());
        assert_eq!(state.artifacts.len(), 2);
        assert_eq!(
            std::fs::read_to_string(root.join("md/m/spec.md")).unwrap(),
            "Heading"
        );
        assert_eq!(items_json(&root)[0]["Наименование"], "Heading");

        // Extract saw the intermediate text
        let prompts: Vec<String> = oracle
            .requests()
            .iter()
            .map(|r| r.messages[0].content.clone())
            .collect();
        assert!(prompts[2].contains("```markdown\nHeading\n```"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rejected_document_writes_nothing() {
        let root = temp_root();
        let oracle = Arc::new(ScriptedOracle::new("m").with_text(INVALID));

        let err = workflow(&oracle, false)
            .run(PipelineState::new("<p>invoice</p>", &root, "spec"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpecExtractError::NotATargetDocument { .. }));
        assert!(!root.join("md").exists());
        assert!(!root.join("items").exists());
        assert_eq!(oracle.requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_conversion_stops_run() {
        let root = temp_root();
        let oracle = Arc::new(
            ScriptedOracle::new("m")
                .with_text(VALID)
                .with_text("no fence here"),
        );

        let err = workflow(&oracle, false)
            .run(PipelineState::new("<p/>", &root, "spec"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpecExtractError::MalformedModelOutput { .. }));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn schema_failure_keeps_intermediate_markdown() {
        let root = temp_root();
        let oracle = Arc::new(
            ScriptedOracle::new("m")
                .with_text(VALID)
                .with_text(CONVERTED)
                .with_text(r#"{"not": "a list"}"#),
        );

        let err = workflow(&oracle, false)
            .run(PipelineState::new("<p/>", &root, "spec"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpecExtractError::SchemaValidation { .. }));
        // Persist runs alongside Extract and is drained before returning
        assert!(root.join("md/m/spec.md").exists());
        assert!(!root.join("items/m/spec.json").exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn refined_mode_extracts_from_converged_text() {
        let root = temp_root();
        let oracle = Arc::new(
            ScriptedOracle::new("m")
                .with_text(VALID)
                .with_text(CONVERTED)
                .with_tool_call("1. Heading", TRANSFER_TO_REVIEWER)
                .with_tool_call("No issues.", TRANSFER_TO_EXTRACTOR)
                .with_text("FINAL LIST: Heading")
                .with_text(ITEMS),
        );
        let observer = Arc::new(RecordingObserver::default());
        let wf = Workflow::builder(Oracles::from_text(oracle.clone()))
            .refine(true)
            .checkpointer(Arc::new(MemoryCheckpointer::default()))
            .observer(observer.clone())
            .build()
            .unwrap();

        let state = wf
            .run(PipelineState::new("<h1>Heading</h1>", &root, "spec"))
            .await
            .unwrap();

        assert_eq!(state.refined_text.as_deref(), Some("FINAL LIST: Heading"));
        let summary = state.refinement.as_ref().unwrap();
        assert_eq!(summary.status, RefinementStatus::Converged);
        assert_eq!(summary.turns, 3);

        let extract_prompt = &oracle.requests()[5].messages[0].content;
        assert!(extract_prompt.contains("FINAL LIST: Heading"));

        // Intermediate markdown is persisted unrefined; both modes share paths
        assert_eq!(
            std::fs::read_to_string(root.join("md/m/spec.md")).unwrap(),
            "Heading"
        );
        assert!(root.join("items/m/spec.json").exists());

        let finished: Vec<StageId> = observer
            .events()
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::StageFinished { stage, error: None, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 5);
        assert_eq!(&finished[..2], &[StageId::Validate, StageId::Convert]);
        let position = |id| finished.iter().position(|s| *s == id).unwrap();
        assert!(position(StageId::Refine) < position(StageId::Extract));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rerun_overwrites_same_paths() {
        let root = temp_root();
        for name in ["first", "second"] {
            let oracle = Arc::new(
                ScriptedOracle::new("m")
                    .with_text(VALID)
                    .with_text(format!("```markdown\n{name}\n```"))
                    .with_text(format!(r#"[{{"Наименование": "{name}"}}]"#)),
            );
            workflow(&oracle, false)
                .run(PipelineState::new("<p/>", &root, "spec"))
                .await
                .unwrap();
        }

        let md_dir: Vec<_> = std::fs::read_dir(root.join("md/m")).unwrap().collect();
        let items_dir: Vec<_> = std::fs::read_dir(root.join("items/m")).unwrap().collect();
        assert_eq!(md_dir.len(), 1);
        assert_eq!(items_dir.len(), 1);
        assert_eq!(items_json(&root)[0]["Наименование"], "second");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn zero_turn_budget_is_config_error() {
        let oracle = Arc::new(ScriptedOracle::new("m"));
        let result = Workflow::builder(Oracles::from_text(oracle)).max_turns(0).build();
        assert!(matches!(result, Err(SpecExtractError::Config { .. })));
    }
}
