//! Provider router: builds the primary and critic handles from config.
//!
//! Both handles usually point at the same backend; the model name and
//! sampling settings travel with each request, not with the provider.

use crate::openai_compat::OpenAiCompatProvider;
use reflector_config::AppConfig;
use reflector_core::provider::Provider;
use std::sync::Arc;

/// The two model capabilities a reflection run needs.
#[derive(Clone)]
pub struct ModelHandles {
    pub primary: Arc<dyn Provider>,
    pub critic: Arc<dyn Provider>,
}

impl ModelHandles {
    /// Use one provider for both roles.
    pub fn shared(provider: Arc<dyn Provider>) -> Self {
        Self {
            primary: provider.clone(),
            critic: provider,
        }
    }
}

/// Build providers from configuration.
pub fn build_from_config(config: &AppConfig) -> ModelHandles {
    let api_key = config.api_key.clone().unwrap_or_default();
    let base_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| default_base_url(&config.provider));

    let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::new(
        &config.provider,
        &base_url,
        &api_key,
    ));

    ModelHandles::shared(provider)
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "gemini" | "google" => "https://generativelanguage.googleapis.com/v1beta/openai".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("gemini").contains("generativelanguage"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }

    #[test]
    fn build_from_default_config() {
        let handles = build_from_config(&AppConfig::default());
        assert_eq!(handles.primary.name(), "gemini");
        assert!(Arc::ptr_eq(&handles.primary, &handles.critic));
    }

    #[test]
    fn api_url_override_wins() {
        let config = AppConfig {
            provider: "local".into(),
            api_url: Some("http://127.0.0.1:9999/v1".into()),
            ..AppConfig::default()
        };
        let handles = build_from_config(&config);
        assert_eq!(handles.critic.name(), "local");
    }
}
