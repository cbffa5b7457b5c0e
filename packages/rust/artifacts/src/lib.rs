//! Filesystem artifact layout.
//!
//! Every document produces at most two artifacts under the output root, keyed
//! by the model that produced them:
//!
//! ```text
//! <root>/
//! ├── md/<model>/<stem>.md        intermediate (or refined) markdown
//! └── items/<model>/<stem>.json   final item list
//! ```
//!
//! Writes go to a hidden temp file in the target directory and are renamed
//! into place, so a reader never observes a half-written artifact.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use uuid::Uuid;

use specextract_shared::{ItemList, Result, SpecExtractError};

/// Which artifact subtree a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Markdown,
    Items,
}

impl ArtifactKind {
    fn subdir(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Items => "items",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Items => "json",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subdir())
    }
}

/// Metadata about one written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// SHA-256 of the written bytes.
    pub sha256: String,
    pub size_bytes: usize,
    /// Number of items, for item-list artifacts.
    pub item_count: Option<usize>,
}

/// Artifact destination for one output root and one model.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    model_dir: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, model: &str) -> Self {
        Self {
            root: root.into(),
            model_dir: model_dir_name(model),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/md/<model>/<stem>.md`
    pub fn markdown_path(&self, stem: &str) -> PathBuf {
        self.path_for(ArtifactKind::Markdown, stem)
    }

    /// `<root>/items/<model>/<stem>.json`
    pub fn items_path(&self, stem: &str) -> PathBuf {
        self.path_for(ArtifactKind::Items, stem)
    }

    fn path_for(&self, kind: ArtifactKind, stem: &str) -> PathBuf {
        self.root
            .join(kind.subdir())
            .join(&self.model_dir)
            .join(format!("{stem}.{}", kind.extension()))
    }

    /// Write the intermediate markdown for `stem`, replacing any previous copy.
    #[instrument(skip_all, fields(stem = %stem, bytes = text.len()))]
    pub fn write_markdown(&self, stem: &str, text: &str) -> Result<ArtifactRecord> {
        let path = self.markdown_path(stem);
        write_atomic(&path, text.as_bytes())?;
        Ok(record(ArtifactKind::Markdown, path, text.as_bytes(), None))
    }

    /// Write the final item list for `stem` as pretty-printed JSON.
    #[instrument(skip_all, fields(stem = %stem, items = items.len()))]
    pub fn write_items(&self, stem: &str, items: &ItemList) -> Result<ArtifactRecord> {
        let json = serde_json::to_string_pretty(items)
            .map_err(|e| SpecExtractError::schema(format!("JSON serialization failed: {e}")))?;
        let path = self.items_path(stem);
        write_atomic(&path, json.as_bytes())?;
        Ok(record(
            ArtifactKind::Items,
            path,
            json.as_bytes(),
            Some(items.len()),
        ))
    }
}

/// Directory name for a model id. Path separators would otherwise nest
/// directories (`mistralai/mistral-large` is a valid model id).
pub fn model_dir_name(model: &str) -> String {
    model
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

/// Write `bytes` to a temp sibling of `path`, then rename it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SpecExtractError::Workflow(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| SpecExtractError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Unique per write so concurrent writers never share a temp file
    let temp = parent.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    std::fs::write(&temp, bytes).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        SpecExtractError::io(&temp, e)
    })?;

    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        SpecExtractError::io(path, e)
    })?;

    debug!(path = %path.display(), size = bytes.len(), "wrote artifact");
    Ok(())
}

fn record(kind: ArtifactKind, path: PathBuf, bytes: &[u8], item_count: Option<usize>) -> ArtifactRecord {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ArtifactRecord {
        kind,
        path,
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes: bytes.len(),
        item_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specextract_shared::Item;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("se_artifacts_{}", Uuid::now_v7()))
    }

    fn list_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn paths_are_keyed_by_model() {
        let store = ArtifactStore::new("/out", "gemini-2.5-flash");
        assert_eq!(
            store.markdown_path("spec1"),
            PathBuf::from("/out/md/gemini-2.5-flash/spec1.md")
        );
        assert_eq!(
            store.items_path("spec1"),
            PathBuf::from("/out/items/gemini-2.5-flash/spec1.json")
        );
    }

    #[test]
    fn model_names_with_separators_stay_flat() {
        assert_eq!(model_dir_name("mistralai/mistral-large"), "mistralai_mistral-large");
        assert_eq!(model_dir_name("models:gemini"), "models_gemini");
    }

    #[test]
    fn write_markdown_creates_directories() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp, "m1");

        let rec = store.write_markdown("doc", "# Title\n").unwrap();
        assert_eq!(rec.kind, ArtifactKind::Markdown);
        assert_eq!(rec.size_bytes, 8);
        assert_eq!(rec.item_count, None);
        assert_eq!(std::fs::read_to_string(&rec.path).unwrap(), "# Title\n");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn write_items_is_pretty_json_with_all_labels() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp, "m1");
        let items = ItemList(vec![Item::named("Насос")]);

        let rec = store.write_items("doc", &items).unwrap();
        assert_eq!(rec.item_count, Some(1));

        let text = std::fs::read_to_string(&rec.path).unwrap();
        assert!(text.contains("\n  {\n"));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let obj = value[0].as_object().unwrap();
        assert_eq!(obj.len(), 15);
        assert_eq!(obj["Наименование"], "Насос");
        assert!(obj["Марка"].is_null());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rewrite_overwrites_without_leftovers() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp, "m1");

        store.write_markdown("doc", "first").unwrap();
        let rec = store.write_markdown("doc", "second").unwrap();

        assert_eq!(std::fs::read_to_string(&rec.path).unwrap(), "second");
        assert_eq!(list_files(&tmp.join("md").join("m1")), vec!["doc.md"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn identical_content_yields_identical_digest() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp, "m1");
        let a = store.write_markdown("a", "same").unwrap();
        let b = store.write_markdown("b", "same").unwrap();
        assert_eq!(a.sha256, b.sha256);
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
