//! Pipeline State: the record threaded through every stage.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use specextract_artifacts::ArtifactRecord;
use specextract_shared::{Result, SpecExtractError};

use crate::swarm::RefinementSummary;

/// State of one document's run.
///
/// `source_markup`, `output_location` and `output_key` are fixed at
/// construction. `intermediate_text`, `refined_text` and `refinement` are
/// write-once and only change through [`PipelineState::apply`]. `artifacts`
/// is append-only.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub run_id: Uuid,
    #[serde(skip)]
    pub source_markup: String,
    pub output_location: PathBuf,
    pub output_key: String,
    pub intermediate_text: Option<String>,
    pub refined_text: Option<String>,
    pub refinement: Option<RefinementSummary>,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Fields returned by one stage.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub intermediate_text: Option<String>,
    pub refined_text: Option<String>,
    pub refinement: Option<RefinementSummary>,
    pub artifacts: Vec<ArtifactRecord>,
}

impl StateUpdate {
    pub fn intermediate(text: String) -> Self {
        Self {
            intermediate_text: Some(text),
            ..Default::default()
        }
    }

    pub fn artifact(record: ArtifactRecord) -> Self {
        Self {
            artifacts: vec![record],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intermediate_text.is_none()
            && self.refined_text.is_none()
            && self.refinement.is_none()
            && self.artifacts.is_empty()
    }
}

impl PipelineState {
    pub fn new(
        source_markup: impl Into<String>,
        output_location: impl Into<PathBuf>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            source_markup: source_markup.into(),
            output_location: output_location.into(),
            output_key: output_key.into(),
            intermediate_text: None,
            refined_text: None,
            refinement: None,
            artifacts: Vec::new(),
        }
    }

    /// Merge a stage's output. Writing an already-set field is an error and
    /// leaves the state untouched.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        check_unset("intermediate_text", &self.intermediate_text, &update.intermediate_text)?;
        check_unset("refined_text", &self.refined_text, &update.refined_text)?;
        check_unset("refinement", &self.refinement, &update.refinement)?;

        if update.intermediate_text.is_some() {
            self.intermediate_text = update.intermediate_text;
        }
        if update.refined_text.is_some() {
            self.refined_text = update.refined_text;
        }
        if update.refinement.is_some() {
            self.refinement = update.refinement;
        }
        self.artifacts.extend(update.artifacts);
        Ok(())
    }

    /// Text consumed by extraction: refined when present, else intermediate.
    pub fn extraction_input(&self) -> Option<&str> {
        self.refined_text
            .as_deref()
            .or(self.intermediate_text.as_deref())
    }
}

fn check_unset<T>(field: &str, current: &Option<T>, incoming: &Option<T>) -> Result<()> {
    if current.is_some() && incoming.is_some() {
        return Err(SpecExtractError::Workflow(format!(
            "{field} is write-once and was already set"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PipelineState {
        PipelineState::new("<html></html>", "/out", "doc")
    }

    #[test]
    fn fields_are_write_once() {
        let mut s = state();
        s.apply(StateUpdate::intermediate("a".into())).unwrap();
        let err = s.apply(StateUpdate::intermediate("b".into())).unwrap_err();
        assert!(matches!(err, SpecExtractError::Workflow(_)));
        assert_eq!(s.intermediate_text.as_deref(), Some("a"));
    }

    #[test]
    fn rejected_update_changes_nothing() {
        let mut s = state();
        s.apply(StateUpdate::intermediate("a".into())).unwrap();
        let update = StateUpdate {
            intermediate_text: Some("b".into()),
            refined_text: Some("r".into()),
            ..Default::default()
        };
        assert!(s.apply(update).is_err());
        assert!(s.refined_text.is_none());
    }

    #[test]
    fn extraction_prefers_refined_text() {
        let mut s = state();
        assert_eq!(s.extraction_input(), None);
        s.apply(StateUpdate::intermediate("draft".into())).unwrap();
        assert_eq!(s.extraction_input(), Some("draft"));
        s.apply(StateUpdate {
            refined_text: Some("final".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.extraction_input(), Some("final"));
    }

    #[test]
    fn empty_update_is_noop() {
        let mut s = state();
        let update = StateUpdate::default();
        assert!(update.is_empty());
        s.apply(update).unwrap();
        assert!(s.intermediate_text.is_none());
        assert!(s.artifacts.is_empty());
    }
}
