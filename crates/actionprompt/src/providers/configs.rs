use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::OnceLock;

use super::base::Provider;
use super::factory::{get_provider, ProviderType};
use crate::errors::{AgentError, AgentResult};
use crate::models::conversation::GenerationOptions;
use crate::models::message::Message;

pub const OPENAI_HOST: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4o-mini";
pub const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-large";
pub const OLLAMA_HOST: &str = "http://localhost:11434/v1";
pub const OLLAMA_MODEL: &str = "llama3.1:8b";
pub const OPEN_ROUTER_HOST: &str = "https://openrouter.ai/api/v1";
pub const OPEN_ROUTER_MODEL: &str = "qwen/qwen3-30b-a3b:free";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
pub const ANTHROPIC_MAX_TOKENS: i32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Environment variable naming the active section of the settings document
pub const ENVIRONMENT_VAR: &str = "ACTIONPROMPT_ENV";

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Mock(Vec<Message>),
}

/// Configuration for any endpoint speaking the OpenAI chat completions format
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiProviderConfig {
    pub service: ProviderType,
    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`
    pub host: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub stream: bool,
    pub embedding_model: String,
}

impl OpenAiProviderConfig {
    pub fn openai<K: Into<String>>(api_key: K) -> Self {
        Self {
            service: ProviderType::OpenAi,
            host: OPENAI_HOST.to_string(),
            api_key: Some(api_key.into()),
            model: OPENAI_MODEL.to_string(),
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: None,
            stream: false,
            embedding_model: OPENAI_EMBEDDING_MODEL.to_string(),
        }
    }

    /// A local Ollama server; no API key is sent
    pub fn ollama() -> Self {
        Self {
            service: ProviderType::Ollama,
            host: OLLAMA_HOST.to_string(),
            api_key: None,
            model: OLLAMA_MODEL.to_string(),
            ..Self::openai("")
        }
    }

    pub fn open_router<K: Into<String>>(api_key: K) -> Self {
        Self {
            service: ProviderType::OpenRouter,
            host: OPEN_ROUTER_HOST.to_string(),
            model: OPEN_ROUTER_MODEL.to_string(),
            ..Self::openai(api_key)
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn from_env() -> AgentResult<Self> {
        let api_key = get_env("OPENAI_API_KEY", true, None)?.unwrap_or_default();
        let host = get_env("OPENAI_HOST", false, Some(OPENAI_HOST.to_string()))?
            .unwrap_or_else(|| OPENAI_HOST.to_string());
        let model = get_env("OPENAI_MODEL", false, Some(OPENAI_MODEL.to_string()))?
            .unwrap_or_else(|| OPENAI_MODEL.to_string());

        Ok(Self::openai(api_key).with_host(host).with_model(model))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub stream: bool,
}

impl AnthropicProviderConfig {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            host: ANTHROPIC_HOST.to_string(),
            api_key: api_key.into(),
            model: ANTHROPIC_MODEL.to_string(),
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: None,
            stream: false,
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn from_env() -> AgentResult<Self> {
        let api_key = get_env("ANTHROPIC_API_KEY", true, None)?.unwrap_or_default();
        let host = get_env("ANTHROPIC_HOST", false, Some(ANTHROPIC_HOST.to_string()))?
            .unwrap_or_else(|| ANTHROPIC_HOST.to_string());
        Ok(Self::new(api_key).with_host(host))
    }
}

/// Helper to read environment variables with a uniform error
fn get_env(key: &str, required: bool, default: Option<String>) -> AgentResult<Option<String>> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) if !required => Ok(default),
        Err(env::VarError::NotPresent) => Err(AgentError::Config(format!(
            "Environment variable '{}' is required but not set.",
            key
        ))),
        Err(e) => Err(AgentError::Config(format!("{}: {}", key, e))),
    }
}

/// One entry of the provider settings document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service")]
pub enum ProviderSettings {
    #[serde(rename = "OpenAI", alias = "openai")]
    OpenAi {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_openai_host")]
        host: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
        #[serde(default)]
        stream: bool,
    },
    #[serde(rename = "Anthropic", alias = "anthropic")]
    Anthropic {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_anthropic_host")]
        host: String,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
        #[serde(default)]
        stream: bool,
    },
    #[serde(rename = "Ollama", alias = "ollama")]
    Ollama {
        #[serde(default = "default_ollama_host")]
        host: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
        #[serde(default)]
        stream: bool,
    },
    #[serde(rename = "OpenRouter", alias = "open_router")]
    OpenRouter {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_open_router_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
        #[serde(default)]
        stream: bool,
    },
    #[serde(rename = "Mock", alias = "mock")]
    Mock,
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::OpenAi { .. } => ProviderType::OpenAi,
            ProviderSettings::Anthropic { .. } => ProviderType::Anthropic,
            ProviderSettings::Ollama { .. } => ProviderType::Ollama,
            ProviderSettings::OpenRouter { .. } => ProviderType::OpenRouter,
            ProviderSettings::Mock => ProviderType::Mock,
        }
    }

    /// Apply per-agent generation overrides on top of the stored settings
    pub fn with_overrides(mut self, overrides: &GenerationOptions) -> Self {
        match &mut self {
            ProviderSettings::OpenAi {
                model,
                temperature,
                max_tokens,
                ..
            }
            | ProviderSettings::Anthropic {
                model,
                temperature,
                max_tokens,
                ..
            }
            | ProviderSettings::Ollama {
                model,
                temperature,
                max_tokens,
                ..
            }
            | ProviderSettings::OpenRouter {
                model,
                temperature,
                max_tokens,
                ..
            } => {
                if let Some(m) = &overrides.model {
                    *model = m.clone();
                }
                if overrides.temperature.is_some() {
                    *temperature = overrides.temperature;
                }
                if overrides.max_tokens.is_some() {
                    *max_tokens = overrides.max_tokens;
                }
            }
            ProviderSettings::Mock => {}
        }
        self
    }

    // Convert to a ProviderConfig, resolving API keys from the environment when absent
    pub fn into_config(self) -> AgentResult<ProviderConfig> {
        match self {
            ProviderSettings::OpenAi {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
                stream,
            } => {
                let api_key = resolve_key(api_key, "OPENAI_API_KEY")?;
                Ok(ProviderConfig::OpenAi(OpenAiProviderConfig {
                    host,
                    model,
                    temperature,
                    max_tokens,
                    stream,
                    ..OpenAiProviderConfig::openai(api_key)
                }))
            }
            ProviderSettings::Anthropic {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
                stream,
            } => {
                let api_key = resolve_key(api_key, "ANTHROPIC_API_KEY")?;
                Ok(ProviderConfig::Anthropic(AnthropicProviderConfig {
                    host,
                    api_key,
                    model,
                    temperature,
                    max_tokens,
                    stream,
                }))
            }
            ProviderSettings::Ollama {
                host,
                model,
                temperature,
                max_tokens,
                stream,
            } => Ok(ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                model,
                temperature,
                max_tokens,
                stream,
                ..OpenAiProviderConfig::ollama()
            })),
            ProviderSettings::OpenRouter {
                api_key,
                model,
                temperature,
                max_tokens,
                stream,
            } => {
                let api_key = resolve_key(api_key, "OPENROUTER_API_KEY")?;
                Ok(ProviderConfig::OpenAi(OpenAiProviderConfig {
                    model,
                    temperature,
                    max_tokens,
                    stream,
                    ..OpenAiProviderConfig::open_router(api_key)
                }))
            }
            ProviderSettings::Mock => Ok(ProviderConfig::Mock(Vec::new())),
        }
    }
}

fn resolve_key(api_key: Option<String>, env_var: &str) -> AgentResult<String> {
    match api_key.filter(|k| !k.is_empty()) {
        Some(key) => Ok(key),
        None => get_env(env_var, true, None).map(Option::unwrap_or_default),
    }
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    OPENAI_MODEL.to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    ANTHROPIC_MODEL.to_string()
}

fn default_ollama_host() -> String {
    OLLAMA_HOST.to_string()
}

fn default_ollama_model() -> String {
    OLLAMA_MODEL.to_string()
}

fn default_open_router_model() -> String {
    OPEN_ROUTER_MODEL.to_string()
}

fn default_temperature() -> Option<f32> {
    Some(DEFAULT_TEMPERATURE)
}

static GLOBAL_REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

/// Named provider settings, resolved for one environment.
///
/// Built once at startup and read-only afterwards; `install` publishes it
/// process-wide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderSettings>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings document.
    ///
    /// When the document has a mapping keyed by `environment` that section is
    /// used, otherwise the document is read as a flat mapping of provider
    /// names and entries without a `service` key are skipped.
    pub fn from_yaml_str(document: &str, environment: Option<&str>) -> AgentResult<Self> {
        let root: serde_yaml::Value =
            serde_yaml::from_str(document).map_err(|e| AgentError::Config(e.to_string()))?;

        let section = environment
            .and_then(|env| root.get(env))
            .filter(|section| section.is_mapping());

        let (mapping, strict) = match section {
            Some(section) => (section, true),
            None => (&root, false),
        };

        let Some(entries) = mapping.as_mapping() else {
            return Err(AgentError::Config(
                "provider settings must be a mapping".to_string(),
            ));
        };

        let mut registry = Self::new();
        for (name, value) in entries {
            let Some(name) = name.as_str() else {
                continue;
            };
            if !strict && value.get("service").is_none() {
                continue;
            }
            let settings: ProviderSettings = serde_yaml::from_value(value.clone())
                .map_err(|e| AgentError::Config(format!("provider {}: {}", name, e)))?;
            registry.insert(name, settings);
        }

        tracing::debug!(providers = registry.providers.len(), "loaded provider settings");
        Ok(registry)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, environment: Option<&str>) -> AgentResult<Self> {
        let document = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AgentError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml_str(&document, environment)
    }

    /// The environment named by `ACTIONPROMPT_ENV`, defaulting to development
    pub fn current_environment() -> String {
        env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, settings: ProviderSettings) {
        self.providers.insert(name.into(), settings);
    }

    pub fn settings(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Build the provider registered as `name` with `overrides` applied
    pub fn provider(
        &self,
        name: &str,
        overrides: &GenerationOptions,
    ) -> AgentResult<Box<dyn Provider>> {
        let settings = self.settings(name).ok_or_else(|| {
            AgentError::Config(format!("Configuration not found for provider: {}", name))
        })?;
        get_provider(settings.clone().with_overrides(overrides).into_config()?)
    }

    /// Publish this registry process-wide; only the first call succeeds
    pub fn install(self) -> AgentResult<()> {
        GLOBAL_REGISTRY
            .set(self)
            .map_err(|_| AgentError::Config("provider registry already installed".to_string()))
    }

    pub fn global() -> Option<&'static ProviderRegistry> {
        GLOBAL_REGISTRY.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const DOCUMENT: &str = r#"
development:
  openai:
    service: OpenAI
    api_key: dev-key
    model: gpt-4o-mini
  ollama:
    service: Ollama
    model: llama3.1:8b
test:
  mock:
    service: Mock
"#;

    #[test]
    fn test_environment_section_is_selected() {
        let registry = ProviderRegistry::from_yaml_str(DOCUMENT, Some("development")).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["ollama", "openai"]);

        match registry.settings("openai") {
            Some(ProviderSettings::OpenAi {
                api_key,
                host,
                temperature,
                ..
            }) => {
                assert_eq!(api_key.as_deref(), Some("dev-key"));
                assert_eq!(host, OPENAI_HOST);
                assert_eq!(*temperature, Some(DEFAULT_TEMPERATURE));
            }
            other => panic!("Expected OpenAI settings, got {:?}", other),
        }

        let registry = ProviderRegistry::from_yaml_str(DOCUMENT, Some("test")).unwrap();
        assert_eq!(registry.settings("mock"), Some(&ProviderSettings::Mock));
    }

    #[test]
    fn test_flat_document_fallback() {
        let document = r#"
open_router:
  service: OpenRouter
  api_key: router-key
log_level: debug
"#;
        let registry = ProviderRegistry::from_yaml_str(document, Some("production")).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["open_router"]);
        assert_eq!(
            registry.settings("open_router").map(|s| s.provider_type()),
            Some(ProviderType::OpenRouter)
        );
    }

    #[test]
    fn test_invalid_entry_is_config_error() {
        let document = "development:\n  broken:\n    service: Nope\n";
        let err = ProviderRegistry::from_yaml_str(document, Some("development")).unwrap_err();
        assert!(matches!(err, AgentError::Config(msg) if msg.starts_with("provider broken")));
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(DOCUMENT.as_bytes())?;
        let registry = ProviderRegistry::from_file(file.path(), Some("development"))?;
        assert!(registry.settings("ollama").is_some());
        Ok(())
    }

    #[test]
    fn test_overrides_and_conversion() {
        let settings = ProviderSettings::Ollama {
            host: default_ollama_host(),
            model: default_ollama_model(),
            temperature: None,
            max_tokens: None,
            stream: false,
        };
        let overrides = GenerationOptions::default()
            .with_model("qwen2.5")
            .with_max_tokens(512);

        match settings.with_overrides(&overrides).into_config().unwrap() {
            ProviderConfig::OpenAi(config) => {
                assert_eq!(config.service, ProviderType::Ollama);
                assert_eq!(config.host, OLLAMA_HOST);
                assert_eq!(config.model, "qwen2.5");
                assert_eq!(config.max_tokens, Some(512));
                assert!(config.api_key.is_none());
            }
            other => panic!("Expected OpenAI-compatible config, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_missing_api_key_falls_back_to_env() {
        env::remove_var("ANTHROPIC_API_KEY");
        let settings = ProviderSettings::Anthropic {
            api_key: None,
            host: default_anthropic_host(),
            model: default_anthropic_model(),
            temperature: None,
            max_tokens: None,
            stream: false,
        };
        assert!(matches!(
            settings.clone().into_config(),
            Err(AgentError::Config(_))
        ));

        env::set_var("ANTHROPIC_API_KEY", "env-key");
        match settings.into_config().unwrap() {
            ProviderConfig::Anthropic(config) => assert_eq!(config.api_key, "env-key"),
            other => panic!("Expected Anthropic config, got {:?}", other),
        }
        env::remove_var("ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_unknown_provider_name() {
        let registry = ProviderRegistry::new();
        let err = registry
            .provider("missing", &GenerationOptions::default())
            .err()
            .unwrap();
        assert_eq!(
            err,
            AgentError::Config("Configuration not found for provider: missing".to_string())
        );
    }
}
