//! Document-processing workflow for procurement technical specifications.
//!
//! A document passes Validate → Convert, then Persist-Intermediate runs next
//! to either Extract (direct mode) or Refine → Extract (refined mode). See
//! [`graph::StageGraph`] for the two shapes and [`engine::Workflow`] for the
//! scheduler.

pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod observe;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod swarm;

pub use checkpoint::{Checkpoint, Checkpointer, MemoryCheckpointer};
pub use engine::{Workflow, WorkflowBuilder};
pub use graph::{GraphMode, StageGraph, StageId};
pub use observe::{
    FanoutObserver, LangfuseObserver, Observer, RecordingObserver, SilentObserver, WorkflowEvent,
};
pub use pipeline::{
    BatchReport, DocumentResult, RunReport, collect_inputs, document_stem, process_batch,
    process_document,
};
pub use state::{PipelineState, StateUpdate};
pub use swarm::{AgentRole, RefinementOutcome, RefinementStatus, RefinementSummary, Swarm};
