//! The reflection loop controller.
//!
//! A run seeds a fresh [`MessageLog`], then alternates between the
//! generate and reflect nodes until [`next_node`] says `Done`:
//!
//! 1. **Cap reached** (assistant replies ≥ `max_iterations`) → done
//! 2. **Critic satisfied** (`needs_further_reflection` cleared) → done
//! 3. **Last message is a reply** → reflect
//! 4. **Last message is feedback** → generate
//! 5. Anything else → done
//!
//! Provider failures are absorbed by the nodes themselves. Whatever still
//! escapes (a panic, or the optional run timeout) is caught at the `run`
//! boundary and folded into the [`RunOutcome`].

use crate::critic::{Critic, ImprovementPolicy, policy_from_config};
use crate::generator::{Generator, ModelSettings};
use crate::observer::{Observers, TracingObserver, preview};
use crate::prompts::{DEFAULT_MAIN_PROMPT, default_reflection_prompt};
use crate::retry::RetryPolicy;
use crate::state::{LoopState, RunContext};
use chrono::Utc;
use futures::FutureExt;
use reflector_config::AppConfig;
use reflector_core::error::{Error, Result};
use reflector_core::event::{LoopEvent, LoopNode, RunObserver};
use reflector_core::message::{Message, MessageLog, Role};
use reflector_core::provider::Provider;
use reflector_providers::ModelHandles;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Returned in place of an answer when the run itself failed.
pub const RUN_FAILURE_RESPONSE: &str = "I encountered an error while processing your request. This might be due to technical limitations or temporary issues.";

/// The result of one run, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub response: String,
    pub iterations: u32,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Pick the node to run after the one that just finished.
pub fn next_node(log: &MessageLog, state: &LoopState) -> LoopNode {
    if log.assistant_count() >= state.max_iterations as usize {
        return LoopNode::Done;
    }
    if !state.needs_further_reflection {
        return LoopNode::Done;
    }
    match log.last() {
        Some(last) if last.role == Role::Assistant => LoopNode::Reflect,
        Some(last) if last.is_feedback() => LoopNode::Generate,
        _ => LoopNode::Done,
    }
}

/// Generate, critique, regenerate: up to `max_iterations` replies per query.
pub struct ReflectionAgent {
    generator: Generator,
    critic: Critic,
    system_prompt: String,
    max_iterations: u32,
    run_timeout: Option<Duration>,
    observers: Observers,
}

impl ReflectionAgent {
    /// Create an agent with default prompts, settings and retry policy.
    pub fn new(primary: Arc<dyn Provider>, critic: Arc<dyn Provider>) -> Self {
        Self {
            generator: Generator::new(primary),
            critic: Critic::new(critic),
            system_prompt: DEFAULT_MAIN_PROMPT.to_string(),
            max_iterations: 3,
            run_timeout: None,
            observers: Observers::new(),
        }
    }

    /// Build an agent from configuration, logging through `tracing`.
    pub fn from_config(config: &AppConfig, handles: &ModelHandles) -> Self {
        let reflection = &config.reflection;
        let policy_kind = reflection.critic_policy;

        let mut agent = Self::new(handles.primary.clone(), handles.critic.clone())
            .with_primary_settings(ModelSettings::from_config(&config.primary))
            .with_critic_settings(ModelSettings::from_config(&config.critic))
            .with_retry_policy(RetryPolicy::from_secs(
                reflection.max_retries,
                reflection.base_delay_secs,
            ))
            .with_policy(policy_from_config(policy_kind))
            .with_max_iterations(reflection.max_iterations)
            .with_observer(Arc::new(TracingObserver::new(reflection.verbose)));

        agent = match &config.prompts.reflection_system_prompt {
            Some(prompt) => agent.with_reflection_prompt(prompt.clone()),
            None => agent.with_reflection_prompt(default_reflection_prompt(policy_kind)),
        };
        if let Some(prompt) = &config.prompts.main_system_prompt {
            agent = agent.with_system_prompt(prompt.clone());
        }
        if let Some(secs) = reflection.run_timeout_secs {
            agent = agent.with_run_timeout(Duration::from_secs(secs));
        }
        agent
    }

    /// Cap on generator calls per run. Values below 1 are raised to 1.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Retry policy for both model calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.generator = self.generator.with_retry_policy(retry.clone());
        self.critic = self.critic.with_retry_policy(retry);
        self
    }

    /// Rule that turns critique text into a verdict.
    pub fn with_policy(mut self, policy: Arc<dyn ImprovementPolicy>) -> Self {
        self.critic = self.critic.with_policy(policy);
        self
    }

    /// System prompt seeded into every run's log.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// System prompt for the critic.
    pub fn with_reflection_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.critic = self.critic.with_system_prompt(prompt);
        self
    }

    pub fn with_primary_settings(mut self, settings: ModelSettings) -> Self {
        self.generator = self.generator.with_settings(settings);
        self
    }

    pub fn with_critic_settings(mut self, settings: ModelSettings) -> Self {
        self.critic = self.critic.with_settings(settings);
        self
    }

    /// Abort runs that take longer than `timeout`.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Attach an observer. Observers see every event of every run.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn primary_model(&self) -> &str {
        &self.generator.settings().model
    }

    pub fn critic_model(&self) -> &str {
        &self.critic.settings().model
    }

    /// Answer `query`. Never fails: errors are reported inside the outcome.
    pub async fn run(&self, query: &str) -> RunOutcome {
        let run = RunContext::new(Uuid::new_v4().to_string(), &self.observers);
        let mut log = MessageLog::seeded(self.system_prompt.clone(), query);
        let mut state = LoopState::new(self.max_iterations);

        run.emit(LoopEvent::RunStarted {
            run_id: run.run_id.clone(),
            query_preview: preview(query, 50),
            max_iterations: state.max_iterations,
            timestamp: Utc::now(),
        });

        let result = {
            let driven = AssertUnwindSafe(self.drive(&mut log, &mut state, &run)).catch_unwind();
            let caught = match self.run_timeout {
                Some(limit) => match tokio::time::timeout(limit, driven).await {
                    Ok(caught) => caught,
                    Err(_) => Ok(Err(Error::RunTimedOut {
                        timeout_secs: limit.as_secs(),
                    })),
                },
                None => driven.await,
            };
            caught.unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload))))
        };

        let error = result.err().map(|e| e.to_string());
        run.emit(LoopEvent::RunFinished {
            run_id: run.run_id.clone(),
            iterations: state.iteration_count,
            error: error.clone(),
            timestamp: Utc::now(),
        });

        let response = match error {
            Some(_) => RUN_FAILURE_RESPONSE.to_string(),
            None => state.terminal_response(&log),
        };
        RunOutcome {
            response,
            iterations: state.iteration_count,
            messages: log.into_messages(),
            error,
        }
    }

    async fn drive(
        &self,
        log: &mut MessageLog,
        state: &mut LoopState,
        run: &RunContext<'_>,
    ) -> Result<()> {
        let mut node = LoopNode::Generate;
        loop {
            match node {
                LoopNode::Generate => {
                    if log.last().map(|m| m.role) != Some(Role::User) {
                        return Err(Error::Internal(
                            "generation requested without a pending user message".into(),
                        ));
                    }
                    self.generator.generate(log, state, run).await;
                }
                LoopNode::Reflect => {
                    self.critic.reflect(log, state, run).await;
                }
                LoopNode::Done => return Ok(()),
            }

            let next = next_node(log, state);
            run.emit(LoopEvent::Transition {
                run_id: run.run_id.clone(),
                from: node,
                to: next,
            });
            node = next;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critic::MarkerPhrase;
    use crate::generator::GENERATION_FALLBACK;
    use crate::retry::FixedJitter;
    use crate::test_helpers::{
        HangingProvider, PanickingProvider, RecordingObserver, ScriptedProvider,
    };
    use reflector_core::error::ProviderError;

    const APPROVE: &str = "Looks good.\nNEEDS IMPROVEMENT: no";
    const REJECT: &str = "Too terse.\nNEEDS IMPROVEMENT: yes";

    fn agent(primary: Arc<ScriptedProvider>, critic: Arc<ScriptedProvider>) -> ReflectionAgent {
        ReflectionAgent::new(primary, critic).with_retry_policy(
            RetryPolicy::new(1, Duration::from_millis(10)).with_jitter(Arc::new(FixedJitter(0.0))),
        )
    }

    #[test]
    fn next_node_rules() {
        let mut state = LoopState::new(3);
        let mut log = MessageLog::seeded("sys", "q");
        // Seeded log with an unanswered query is not a feedback turn
        assert_eq!(next_node(&log, &state), LoopNode::Done);

        log.push(Message::assistant("a"));
        assert_eq!(next_node(&log, &state), LoopNode::Reflect);

        log.push(Message::feedback("more"));
        assert_eq!(next_node(&log, &state), LoopNode::Generate);

        state.needs_further_reflection = false;
        assert_eq!(next_node(&log, &state), LoopNode::Done);
    }

    #[test]
    fn cap_beats_critic() {
        let state = LoopState::new(1);
        let mut log = MessageLog::seeded("sys", "q");
        log.push(Message::assistant("a"));
        assert!(state.needs_further_reflection);
        assert_eq!(next_node(&log, &state), LoopNode::Done);
    }

    #[tokio::test]
    async fn satisfied_on_first_reply() {
        let primary = Arc::new(ScriptedProvider::always("4."));
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = agent(primary.clone(), critic.clone());

        let outcome = agent.run("What is 2+2?").await;

        assert_eq!(outcome.response, "4.");
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.is_failure());
        assert_eq!(primary.call_count(), 1);
        assert_eq!(critic.call_count(), 1);
        assert_eq!(outcome.messages.len(), 3);
    }

    #[tokio::test]
    async fn always_unsatisfied_critic_hits_the_cap() {
        let primary = Arc::new(ScriptedProvider::replies(&["A", "B", "C"]));
        let critic = Arc::new(ScriptedProvider::always(REJECT));
        let agent = agent(primary.clone(), critic.clone()).with_max_iterations(3);

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, "C");
        assert_eq!(outcome.iterations, 3);
        assert_eq!(primary.call_count(), 3);
        assert_eq!(critic.call_count(), 2);

        // sys, q, A, fb, B, fb, C
        let roles: Vec<Role> = outcome.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant
            ]
        );
        for pair in outcome.messages.windows(2) {
            if pair[1].is_feedback() {
                assert_eq!(pair[0].role, Role::Assistant);
            }
        }
    }

    #[tokio::test]
    async fn second_reply_replays_feedback_to_primary() {
        let primary = Arc::new(ScriptedProvider::replies(&["A", "B"]));
        let critic = Arc::new(ScriptedProvider::sequence(vec![
            Ok(REJECT.into()),
            Ok(APPROVE.into()),
        ]));
        let agent = agent(primary.clone(), critic.clone());

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, "B");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(critic.call_count(), 2);
        let second = &primary.requests()[1];
        assert_eq!(second.messages.len(), 4);
        assert!(second.messages[3].is_feedback());
    }

    #[tokio::test]
    async fn single_iteration_skips_the_critic() {
        let primary = Arc::new(ScriptedProvider::always("only"));
        let critic = Arc::new(ScriptedProvider::always(REJECT));
        let agent = agent(primary.clone(), critic.clone()).with_max_iterations(0);

        let outcome = agent.run("q").await;

        assert_eq!(agent.max_iterations(), 1);
        assert_eq!(outcome.response, "only");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(critic.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_primary_returns_fallback_not_error() {
        let primary = Arc::new(ScriptedProvider::failing(ProviderError::Network(
            "down".into(),
        )));
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = agent(primary, critic);

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, GENERATION_FALLBACK);
        assert!(!outcome.is_failure());
    }

    #[tokio::test]
    async fn marker_policy_via_builder() {
        let primary = Arc::new(ScriptedProvider::replies(&["A", "B"]));
        let critic = Arc::new(ScriptedProvider::sequence(vec![
            Ok("Add detail.".into()),
            Ok("No critique needed".into()),
        ]));
        let agent = agent(primary, critic).with_policy(Arc::new(MarkerPhrase::default()));

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, "B");
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn panic_is_caught_at_run_boundary() {
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = ReflectionAgent::new(Arc::new(PanickingProvider), critic);

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, RUN_FAILURE_RESPONSE);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.error.as_deref().unwrap().contains("provider exploded"));
        // Partial log is still returned
        assert_eq!(outcome.messages.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_is_reported() {
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = ReflectionAgent::new(Arc::new(HangingProvider), critic)
            .with_run_timeout(Duration::from_secs(5));

        let outcome = agent.run("q").await;

        assert_eq!(outcome.response, RUN_FAILURE_RESPONSE);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Run timed out after 5s")
        );
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let recorder = Arc::new(RecordingObserver::default());
        let primary = Arc::new(ScriptedProvider::always("4."));
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = agent(primary, critic).with_observer(recorder.clone());

        agent.run("What is 2+2?").await;

        let events = recorder.events();
        assert!(matches!(events.first(), Some(LoopEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(LoopEvent::RunFinished { iterations: 1, error: None, .. })
        ));
        let run_id = events[0].run_id().to_string();
        assert!(events.iter().all(|e| e.run_id() == run_id));
        assert!(events.iter().any(|e| matches!(
            e,
            LoopEvent::Transition { from: LoopNode::Reflect, to: LoopNode::Done, .. }
        )));
    }

    #[tokio::test]
    async fn runs_are_independent() {
        let primary = Arc::new(ScriptedProvider::always("same"));
        let critic = Arc::new(ScriptedProvider::always(APPROVE));
        let agent = agent(primary, critic);

        let (a, b) = tokio::join!(agent.run("first"), agent.run("second"));

        assert_eq!(a.messages[1].content, "first");
        assert_eq!(b.messages[1].content, "second");
        assert_eq!(a.iterations, 1);
        assert_eq!(b.iterations, 1);
    }

    #[test]
    fn from_config_applies_settings() {
        let mut config = AppConfig::default();
        config.reflection.max_iterations = 5;
        config.primary.model = "main-x".into();
        config.critic.model = "critic-y".into();
        let handles = ModelHandles::shared(Arc::new(ScriptedProvider::always("x")));

        let agent = ReflectionAgent::from_config(&config, &handles);

        assert_eq!(agent.max_iterations(), 5);
        assert_eq!(agent.primary_model(), "main-x");
        assert_eq!(agent.critic_model(), "critic-y");
    }
}
