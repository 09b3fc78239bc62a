//! LLM integration.
//!
//! Every job runs against its owner's credential, so providers are built per
//! credential through a [`ProviderFactory`] rather than once at startup.

pub mod anthropic;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::{Document, GenerationRequest, GenerationResponse, LlmProvider};

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, LlmError};
use crate::store::Credential;

/// Provider settings shared by every credential.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Key seeded for the default owner at startup, if set.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let request_timeout = match std::env::var("BOARDROOM_LLM_TIMEOUT_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: "BOARDROOM_LLM_TIMEOUT_SECS".to_string(),
                    message: format!("{e}"),
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => defaults.request_timeout,
        };

        Ok(Self {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: std::env::var("BOARDROOM_MODEL").unwrap_or(defaults.model),
            base_url: std::env::var("BOARDROOM_LLM_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout,
        })
    }
}

/// Builds a provider bound to one owner's credential.
pub trait ProviderFactory: Send + Sync {
    fn for_credential(&self, credential: &Credential) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Factory producing [`AnthropicProvider`]s over one shared HTTP client.
pub struct AnthropicFactory {
    client: reqwest::Client,
    config: LlmConfig,
}

impl AnthropicFactory {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;
        tracing::info!("Using Anthropic (model: {})", config.model);
        Ok(Self { client, config })
    }
}

impl ProviderFactory for AnthropicFactory {
    fn for_credential(&self, credential: &Credential) -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(Arc::new(AnthropicProvider::new(
            self.client.clone(),
            credential.api_key.clone(),
            &self.config.model,
            &self.config.base_url,
            self.config.request_timeout,
        )))
    }
}
