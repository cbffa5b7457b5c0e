//! Backend selection from the resolved runtime configuration.

use std::sync::Arc;

use tracing::info;

use specextract_shared::{ProviderKind, ProviderSettings, Result};

use crate::gemini::GeminiClient;
use crate::mistral::MistralClient;
use crate::oracle::{StructuredOracle, TextOracle};
use crate::structured::SchemaOracle;

/// The pair of oracles the workflow is wired with.
#[derive(Clone)]
pub struct Oracles {
    pub text: Arc<dyn TextOracle>,
    pub structured: Arc<dyn StructuredOracle>,
}

impl Oracles {
    /// Use one text backend for both roles, with schema-guided parsing on top.
    pub fn from_text(text: Arc<dyn TextOracle>) -> Self {
        let structured: Arc<dyn StructuredOracle> = Arc::new(SchemaOracle::new(text.clone()));
        Self { text, structured }
    }

    /// Build the configured backend.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let text: Arc<dyn TextOracle> = match settings.kind {
            ProviderKind::Google => {
                let mut client = GeminiClient::new(&settings.api_key, &settings.model)?;
                if let Some(url) = &settings.base_url {
                    client = client.with_base_url(url.as_str());
                }
                Arc::new(client)
            }
            ProviderKind::Mistral => {
                let mut client = MistralClient::new(&settings.api_key, &settings.model)?;
                if let Some(url) = &settings.base_url {
                    client = client.with_base_url(url.as_str());
                }
                Arc::new(client)
            }
        };

        info!(provider = settings.kind.as_str(), model = %settings.model, "oracle backend ready");
        Ok(Self::from_text(text))
    }

    /// Model identifier used to key artifacts.
    pub fn model(&self) -> &str {
        self.text.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_configured_backend() {
        let settings = ProviderSettings {
            kind: ProviderKind::Mistral,
            model: "mistral-small-latest".into(),
            api_key: "k".into(),
            base_url: None,
        };
        let oracles = Oracles::from_settings(&settings).expect("build");
        assert_eq!(oracles.model(), "mistral-small-latest");
    }
}
