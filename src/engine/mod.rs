pub mod provider;
pub mod providers;
pub mod sse;
pub mod types;

use std::sync::Arc;

use crate::config::{EngineConfig, ProviderKind};
use crate::engine::provider::LanguageModel;
use crate::engine::providers::anthropic::AnthropicProvider;
use crate::engine::providers::openai_compatible::OpenAiCompatibleProvider;

/// Builds the engine named by the config entry. Provider selection is an
/// explicit config value; nothing is inferred from the model name.
pub fn build_engine(config: &EngineConfig) -> Arc<dyn LanguageModel> {
    match config.provider {
        ProviderKind::OpenaiCompatible => Arc::new(OpenAiCompatibleProvider::new(config)),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)),
    }
}
