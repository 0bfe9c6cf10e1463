//! The generate step: one call to the primary model over the full log.

use crate::observer::preview;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::{LoopState, RunContext};
use reflector_config::ModelConfig;
use reflector_core::event::{LoopEvent, LoopNode};
use reflector_core::message::{Message, MessageLog};
use reflector_core::provider::{Provider, ProviderRequest, Usage};
use std::sync::Arc;
use tracing::debug;

/// Appended in place of a reply when every attempt failed.
pub const GENERATION_FALLBACK: &str =
    "I apologize, but I'm currently experiencing technical difficulties. Please try again later.";

/// Model name and sampling settings sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl ModelSettings {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: Some(config.max_tokens),
            top_p: config.top_p,
        }
    }

    pub fn primary() -> Self {
        Self::from_config(&ModelConfig::primary())
    }

    pub fn critic() -> Self {
        Self::from_config(&ModelConfig::critic())
    }

    pub(crate) fn request(&self, messages: Vec<Message>) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }
}

/// What a generation step did.
#[derive(Debug, Clone, Default)]
pub struct GenerationOutcome {
    /// The fallback apology was appended instead of a model reply
    pub fallback: bool,
    pub usage: Option<Usage>,
}

/// Calls the primary model and appends its reply.
#[derive(Clone)]
pub struct Generator {
    provider: Arc<dyn Provider>,
    settings: ModelSettings,
    retry: RetryPolicy,
}

impl Generator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            settings: ModelSettings::primary(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Run one generation. Provider failures never escape: after the last
    /// attempt the fallback text is appended instead.
    pub async fn generate(
        &self,
        log: &mut MessageLog,
        state: &mut LoopState,
        run: &RunContext<'_>,
    ) -> GenerationOutcome {
        state.iteration_count += 1;
        let iteration = state.iteration_count;
        run.emit(LoopEvent::GenerationStarted {
            run_id: run.run_id.clone(),
            iteration,
        });

        let history = log.messages().to_vec();
        let result = retry_with_backoff(
            &self.retry,
            || {
                let request = self.settings.request(history.clone());
                async move { self.provider.complete(request).await }
            },
            |notice| {
                run.emit(LoopEvent::RetryScheduled {
                    run_id: run.run_id.clone(),
                    operation: LoopNode::Generate,
                    attempt: notice.attempt,
                    base_delay_ms: millis(notice.base_delay),
                    delay_ms: millis(notice.delay),
                    error: notice.error.to_string(),
                })
            },
        )
        .await;

        let outcome = match result {
            Ok(response) => {
                debug!(
                    provider = %self.provider.name(),
                    model = %response.model,
                    reply = %preview(&response.message.content, 80),
                    "Primary model replied"
                );
                log.push(Message::assistant(response.message.content));
                GenerationOutcome {
                    fallback: false,
                    usage: response.usage,
                }
            }
            Err(err) => {
                run.emit(LoopEvent::RetriesExhausted {
                    run_id: run.run_id.clone(),
                    operation: LoopNode::Generate,
                    attempts: err.attempts,
                    error: err.last.to_string(),
                });
                log.push(Message::assistant(GENERATION_FALLBACK));
                GenerationOutcome {
                    fallback: true,
                    usage: None,
                }
            }
        };

        run.emit(LoopEvent::GenerationCompleted {
            run_id: run.run_id.clone(),
            iteration,
            fallback: outcome.fallback,
            tokens_used: outcome.usage.as_ref().map(|u| u.total_tokens),
        });
        outcome
    }
}

pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
