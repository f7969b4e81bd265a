use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig, mock::MockProvider,
    openai::OpenAiProvider,
};
use crate::errors::AgentResult;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter};

#[derive(EnumIter, Display, AsRefStr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Ollama,
    OpenRouter,
    Mock,
}

pub fn get_provider(config: ProviderConfig) -> AgentResult<Box<dyn Provider>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => {
            tracing::debug!(
                service = %openai_config.service,
                model = %openai_config.model,
                "building provider"
            );
            Ok(Box::new(OpenAiProvider::new(openai_config)?))
        }
        ProviderConfig::Anthropic(anthropic_config) => {
            tracing::debug!(
                service = "anthropic",
                model = %anthropic_config.model,
                "building provider"
            );
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Mock(responses) => Ok(Box::new(MockProvider::new(responses))),
    }
}
