//! Static stage graphs.
//!
//! Two variants exist and one is picked at startup:
//!
//! ```text
//! direct:   Validate → Convert → { PersistIntermediate, Extract }
//! refined:  Validate → Convert → { PersistIntermediate, Refine → Extract }
//! ```

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use specextract_shared::{Result, SpecExtractError};

/// One node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Validate,
    Convert,
    PersistIntermediate,
    Refine,
    Extract,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Convert => "convert",
            Self::PersistIntermediate => "persist_intermediate",
            Self::Refine => "refine",
            Self::Extract => "extract",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which graph variant is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    Direct,
    Refined,
}

impl std::fmt::Display for GraphMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Refined => "refined",
        })
    }
}

/// A fixed set of stages with their dependencies, in declaration order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    mode: GraphMode,
    nodes: Vec<(StageId, Vec<StageId>)>,
}

impl StageGraph {
    /// Graph with refinement disabled.
    pub fn direct() -> Self {
        Self {
            mode: GraphMode::Direct,
            nodes: vec![
                (StageId::Validate, vec![]),
                (StageId::Convert, vec![StageId::Validate]),
                (StageId::PersistIntermediate, vec![StageId::Convert]),
                (StageId::Extract, vec![StageId::Convert]),
            ],
        }
    }

    /// Graph with the refinement loop between Convert and Extract.
    pub fn refined() -> Self {
        Self {
            mode: GraphMode::Refined,
            nodes: vec![
                (StageId::Validate, vec![]),
                (StageId::Convert, vec![StageId::Validate]),
                (StageId::PersistIntermediate, vec![StageId::Convert]),
                (StageId::Refine, vec![StageId::Convert]),
                (StageId::Extract, vec![StageId::Refine]),
            ],
        }
    }

    pub fn for_mode(refine: bool) -> Self {
        if refine { Self::refined() } else { Self::direct() }
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.nodes.iter().any(|(n, _)| *n == id)
    }

    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.nodes.iter().map(|(id, _)| *id)
    }

    pub fn dependencies(&self, id: StageId) -> &[StageId] {
        self.nodes
            .iter()
            .find(|(n, _)| *n == id)
            .map(|(_, deps)| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Stages not yet started whose dependencies are all done.
    pub fn ready(&self, done: &HashSet<StageId>, started: &HashSet<StageId>) -> Vec<StageId> {
        self.nodes
            .iter()
            .filter(|(id, deps)| !started.contains(id) && deps.iter().all(|d| done.contains(d)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Check the graph shape: Validate is the only root, stages are unique,
    /// every dependency is a declared stage, and there are no cycles.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (id, _) in &self.nodes {
            if !seen.insert(*id) {
                return Err(graph_err(format!("stage {id} declared twice")));
            }
        }

        for (id, deps) in &self.nodes {
            for dep in deps {
                if !seen.contains(dep) {
                    return Err(graph_err(format!("{id} depends on undeclared stage {dep}")));
                }
            }
        }

        let roots: Vec<StageId> = self
            .nodes
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if roots != [StageId::Validate] {
            return Err(graph_err(format!(
                "graph must have Validate as its only root, found {roots:?}"
            )));
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm; errors on a cycle.
    pub fn topological_order(&self) -> Result<Vec<StageId>> {
        let mut remaining: HashMap<StageId, usize> = self
            .nodes
            .iter()
            .map(|(id, deps)| (*id, deps.len()))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        loop {
            let next: Vec<StageId> = self
                .stages()
                .filter(|id| remaining.get(id) == Some(&0))
                .collect();
            if next.is_empty() {
                break;
            }
            for id in next {
                remaining.remove(&id);
                order.push(id);
                for (dependent, deps) in &self.nodes {
                    if deps.contains(&id) {
                        if let Some(count) = remaining.get_mut(dependent) {
                            *count -= 1;
                        }
                    }
                }
            }
        }

        if !remaining.is_empty() {
            let mut stuck: Vec<StageId> = remaining.into_keys().collect();
            stuck.sort();
            return Err(graph_err(format!("cycle among stages {stuck:?}")));
        }
        Ok(order)
    }

    #[cfg(test)]
    fn custom(nodes: Vec<(StageId, Vec<StageId>)>) -> Self {
        Self {
            mode: GraphMode::Direct,
            nodes,
        }
    }
}

fn graph_err(msg: String) -> SpecExtractError {
    SpecExtractError::Workflow(format!("invalid stage graph: {msg}"))
}
