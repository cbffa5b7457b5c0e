//! Application configuration for specextract.
//!
//! User config lives at `~/.specextract/specextract.toml`.
//! CLI flags override config file values, which override defaults.
//! The resolved [`RuntimeConfig`] is built once at process start and never
//! mutated afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SpecExtractError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "specextract.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".specextract";

// ---------------------------------------------------------------------------
// Config structs (matching specextract.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Which backend answers oracle calls.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Google Gemini settings.
    #[serde(default = "default_google")]
    pub google: BackendConfig,

    /// Mistral settings.
    #[serde(default = "default_mistral")]
    pub mistral: BackendConfig,

    /// Langfuse tracing settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default artifact output root.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Run the extractor/reviewer refinement loop before extraction.
    #[serde(default)]
    pub refine: bool,

    /// Turn budget shared by both refinement roles.
    #[serde(default = "default_max_refine_turns")]
    pub max_refine_turns: u32,

    /// Documents processed concurrently in batch mode.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Persist refinement transcripts so an interrupted loop can resume.
    #[serde(default = "default_true")]
    pub checkpoints: bool,

    /// libSQL database holding refinement checkpoints.
    #[serde(default = "default_checkpoint_db")]
    pub checkpoint_db: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            refine: false,
            max_refine_turns: default_max_refine_turns(),
            concurrency: default_concurrency(),
            checkpoints: true,
            checkpoint_db: default_checkpoint_db(),
        }
    }
}

fn default_output_dir() -> String {
    "data".into()
}
fn default_max_refine_turns() -> u32 {
    8
}
fn default_concurrency() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_checkpoint_db() -> String {
    "~/.specextract/checkpoints.db".into()
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend name: "google" or "mistral".
    #[serde(default = "default_provider")]
    pub name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider(),
        }
    }
}

fn default_provider() -> String {
    "google".into()
}

/// `[google]` / `[mistral]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,

    /// Model identifier sent to the backend.
    pub model: String,

    /// Env var that overrides `model` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_env: Option<String>,

    /// Override for the API base URL (proxies, tests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_google() -> BackendConfig {
    BackendConfig {
        api_key_env: "GOOGLE_API_KEY".into(),
        model: "gemini-2.5-flash".into(),
        model_env: Some("GOOGLE_MODEL".into()),
        base_url: None,
    }
}

fn default_mistral() -> BackendConfig {
    BackendConfig {
        api_key_env: "MISTRAL_API_KEY".into(),
        model: "mistral-large-latest".into(),
        model_env: Some("MISTRAL_MODEL".into()),
        base_url: None,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            provider: ProviderConfig::default(),
            google: default_google(),
            mistral: default_mistral(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// `[observability]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Env var holding the Langfuse public key.
    #[serde(default = "default_public_key_env")]
    pub public_key_env: String,

    /// Env var holding the Langfuse secret key.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,

    /// Langfuse host.
    #[serde(default = "default_langfuse_host")]
    pub host: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            public_key_env: default_public_key_env(),
            secret_key_env: default_secret_key_env(),
            host: default_langfuse_host(),
        }
    }
}

fn default_public_key_env() -> String {
    "LANGFUSE_PUBLIC_KEY".into()
}
fn default_secret_key_env() -> String {
    "LANGFUSE_SECRET_KEY".into()
}
fn default_langfuse_host() -> String {
    "http://localhost:3000".into()
}

// ---------------------------------------------------------------------------
// Overrides & resolved runtime config
// ---------------------------------------------------------------------------

/// CLI-level overrides applied on top of the file config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub refine: Option<bool>,
    pub max_refine_turns: Option<u32>,
    pub concurrency: Option<u32>,
}

/// Supported oracle backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Mistral,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Mistral => "mistral",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = SpecExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "mistral" => Ok(Self::Mistral),
            other => Err(SpecExtractError::config(format!(
                "invalid provider '{other}': expected 'google' or 'mistral'"
            ))),
        }
    }
}

/// Credentials and endpoint of the selected backend.
#[derive(Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<Url>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Langfuse credentials; present only when both keys are set.
#[derive(Clone)]
pub struct LangfuseSettings {
    pub public_key: String,
    pub secret_key: String,
    pub host: Url,
}

impl std::fmt::Debug for LangfuseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LangfuseSettings")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .field("host", &self.host.as_str())
            .finish()
    }
}

/// Fully resolved, immutable configuration for one process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub provider: ProviderSettings,
    pub refine: bool,
    pub max_refine_turns: u32,
    pub concurrency: usize,
    pub checkpoints: bool,
    pub checkpoint_db: PathBuf,
    pub output_dir: PathBuf,
    pub langfuse: Option<LangfuseSettings>,
}

impl AppConfig {
    /// Resolve the file config plus overrides against the environment.
    pub fn resolve(&self, overrides: &ConfigOverrides) -> Result<RuntimeConfig> {
        self.resolve_with(overrides, |name| std::env::var(name).ok())
    }

    /// Same as [`AppConfig::resolve`] with an injectable env lookup.
    pub fn resolve_with(
        &self,
        overrides: &ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<RuntimeConfig> {
        let kind: ProviderKind = overrides
            .provider
            .as_deref()
            .unwrap_or(&self.provider.name)
            .parse()?;

        let backend = match kind {
            ProviderKind::Google => &self.google,
            ProviderKind::Mistral => &self.mistral,
        };

        let model = overrides
            .model
            .clone()
            .or_else(|| backend.model_env.as_deref().and_then(&env))
            .unwrap_or_else(|| backend.model.clone());
        if model.trim().is_empty() {
            return Err(SpecExtractError::config(format!(
                "no model configured for provider '{}'",
                kind.as_str()
            )));
        }

        let api_key = match env(&backend.api_key_env) {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                return Err(SpecExtractError::config(format!(
                    "{} API key not found. Set the {} environment variable.",
                    kind.as_str(),
                    backend.api_key_env
                )));
            }
        };

        let base_url = backend
            .base_url
            .as_deref()
            .map(|u| {
                Url::parse(u)
                    .map_err(|e| SpecExtractError::config(format!("invalid base_url '{u}': {e}")))
            })
            .transpose()?;

        let max_refine_turns = overrides
            .max_refine_turns
            .unwrap_or(self.defaults.max_refine_turns);
        if max_refine_turns == 0 {
            return Err(SpecExtractError::config(
                "max_refine_turns must be at least 1",
            ));
        }

        let concurrency = overrides
            .concurrency
            .unwrap_or(self.defaults.concurrency)
            .max(1) as usize;

        Ok(RuntimeConfig {
            provider: ProviderSettings {
                kind,
                model,
                api_key,
                base_url,
            },
            refine: overrides.refine.unwrap_or(self.defaults.refine),
            max_refine_turns,
            concurrency,
            checkpoints: self.defaults.checkpoints,
            checkpoint_db: expand_home(&self.defaults.checkpoint_db),
            output_dir: expand_home(&self.defaults.output_dir),
            langfuse: self.resolve_langfuse(&env)?,
        })
    }

    fn resolve_langfuse(
        &self,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Option<LangfuseSettings>> {
        let obs = &self.observability;
        let public_key = env(&obs.public_key_env).filter(|k| !k.trim().is_empty());
        let secret_key = env(&obs.secret_key_env).filter(|k| !k.trim().is_empty());

        match (public_key, secret_key) {
            (Some(public_key), Some(secret_key)) => {
                let host = Url::parse(&obs.host).map_err(|e| {
                    SpecExtractError::config(format!("invalid observability host '{}': {e}", obs.host))
                })?;
                Ok(Some(LangfuseSettings {
                    public_key,
                    secret_key,
                    host,
                }))
            }
            _ => {
                tracing::debug!("langfuse keys not set, observability disabled");
                Ok(None)
            }
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.specextract/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SpecExtractError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.specextract/specextract.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SpecExtractError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        SpecExtractError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SpecExtractError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SpecExtractError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SpecExtractError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
