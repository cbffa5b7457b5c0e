//! Stage implementations.
//!
//! Each stage reads a snapshot of the [`PipelineState`] and returns only the
//! fields it writes.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use specextract_artifacts::ArtifactStore;
use specextract_llm::Oracles;
use specextract_shared::{Result, SpecExtractError, extract_fenced};

use crate::graph::StageId;
use crate::observe::Observer;
use crate::state::{PipelineState, StateUpdate};
use crate::swarm::Swarm;

/// Dependencies shared by every stage of a workflow.
pub struct StageContext {
    pub oracles: Oracles,
    pub swarm: Swarm,
    pub observer: Arc<dyn Observer>,
}

impl StageContext {
    fn artifacts(&self, state: &PipelineState) -> ArtifactStore {
        ArtifactStore::new(&state.output_location, self.oracles.model())
    }
}

pub const CONVERT_INSTRUCTION: &str = "Convert the HTML document into Markdown. Output should not \
contain any tables. Each table from the original document must be decomposed using headings. Your \
final output should be inside a markdown code block.";

pub fn validation_prompt(markup: &str) -> String {
    format!(
        "Check if the following document is a procurement technical specification.\n\n```html\n{markup}\n```"
    )
}

pub fn extraction_prompt(markdown: &str) -> String {
    format!(
        "Extract structured item data from the following technical specification.\n\n```markdown\n{markdown}\n```"
    )
}

pub(crate) async fn run_stage(
    id: StageId,
    ctx: &StageContext,
    state: &PipelineState,
) -> Result<StateUpdate> {
    match id {
        StageId::Validate => validate(ctx, state).await,
        StageId::Convert => convert(ctx, state).await,
        StageId::PersistIntermediate => persist_intermediate(ctx, state),
        StageId::Refine => refine(ctx, state).await,
        StageId::Extract => extract(ctx, state).await,
    }
}

#[instrument(skip_all, fields(key = %state.output_key))]
async fn validate(ctx: &StageContext, state: &PipelineState) -> Result<StateUpdate> {
    let is_target = ctx
        .oracles
        .structured
        .classify(&validation_prompt(&state.source_markup))
        .await?;

    if !is_target {
        info!("document rejected by validation gate");
        return Err(SpecExtractError::not_target(format!(
            "'{}' was classified as another kind of document",
            state.output_key
        )));
    }
    Ok(StateUpdate::default())
}

#[instrument(skip_all, fields(key = %state.output_key, bytes = state.source_markup.len()))]
async fn convert(ctx: &StageContext, state: &PipelineState) -> Result<StateUpdate> {
    let document = format!("```html\n{}\n```", state.source_markup);
    let reply = ctx.oracles.text.transform(CONVERT_INSTRUCTION, &document).await?;
    let markdown = extract_fenced(&reply, "markdown")?;
    debug!(chars = markdown.len(), "converted to markdown");
    Ok(StateUpdate::intermediate(markdown))
}

#[instrument(skip_all, fields(key = %state.output_key))]
fn persist_intermediate(ctx: &StageContext, state: &PipelineState) -> Result<StateUpdate> {
    let Some(text) = state.intermediate_text.as_deref() else {
        debug!("no intermediate text, nothing to persist");
        return Ok(StateUpdate::default());
    };
    let record = ctx.artifacts(state).write_markdown(&state.output_key, text)?;
    info!(path = %record.path.display(), "wrote intermediate markdown");
    Ok(StateUpdate::artifact(record))
}

#[instrument(skip_all, fields(key = %state.output_key))]
async fn refine(ctx: &StageContext, state: &PipelineState) -> Result<StateUpdate> {
    let markdown = state
        .intermediate_text
        .as_deref()
        .ok_or_else(|| SpecExtractError::Workflow("refine scheduled before convert".into()))?;

    let outcome = ctx
        .swarm
        .refine(state.run_id, &state.output_key, markdown)
        .await?;

    Ok(StateUpdate {
        refined_text: Some(outcome.text),
        refinement: Some(outcome.summary),
        ..Default::default()
    })
}

#[instrument(skip_all, fields(key = %state.output_key, refined = state.refined_text.is_some()))]
async fn extract(ctx: &StageContext, state: &PipelineState) -> Result<StateUpdate> {
    let input = state
        .extraction_input()
        .ok_or_else(|| SpecExtractError::Workflow("extract scheduled before convert".into()))?;

    let items = ctx
        .oracles
        .structured
        .extract_items(&extraction_prompt(input))
        .await?;

    let record = ctx.artifacts(state).write_items(&state.output_key, &items)?;
    info!(path = %record.path.display(), items = items.len(), "wrote item list");
    Ok(StateUpdate::artifact(record))
}
