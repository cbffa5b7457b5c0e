//! Shared types, error model, and configuration for specextract.
//!
//! This crate is the foundation depended on by all other specextract crates.
//! It provides:
//! - [`SpecExtractError`] — the unified error type
//! - Domain types ([`Item`], [`ItemList`], [`HasAnalogues`])
//! - Configuration ([`AppConfig`], [`RuntimeConfig`], config loading)
//! - Fenced-payload extraction for model replies

pub mod config;
pub mod error;
pub mod fence;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BackendConfig, ConfigOverrides, DefaultsConfig, LangfuseSettings,
    ObservabilityConfig, ProviderConfig, ProviderKind, ProviderSettings, RuntimeConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{Result, SpecExtractError};
pub use fence::{extract_fenced, strip_optional_fence};
pub use types::{HasAnalogues, ITEM_FIELD_LABELS, Item, ItemList};
