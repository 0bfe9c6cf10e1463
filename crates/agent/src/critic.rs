//! The reflect step: an isolated critique of the latest reply.
//!
//! The critic never sees the running transcript. It gets its own system
//! prompt plus a single user message holding the original query and the
//! reply under review. Whether the critique asks for another round is
//! decided by an [`ImprovementPolicy`].

use crate::generator::{ModelSettings, millis};
use crate::observer::preview;
use crate::prompts::default_reflection_prompt;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::{LoopState, RunContext};
use reflector_config::CriticPolicyKind;
use reflector_core::event::{LoopEvent, LoopNode};
use reflector_core::message::{Message, MessageLog, Role};
use reflector_core::provider::Provider;
use std::sync::Arc;
use tracing::warn;

/// Phrase a marker-style critic uses to approve a reply.
pub const NO_CRITIQUE_MARKER: &str = "No critique needed";

/// Label of the verdict field in a structured critique.
pub const NEEDS_IMPROVEMENT_LABEL: &str = "NEEDS IMPROVEMENT:";

/// Decides from critique text whether the reply should be regenerated.
pub trait ImprovementPolicy: Send + Sync {
    fn needs_improvement(&self, critique: &str) -> bool;
}

impl<F> ImprovementPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn needs_improvement(&self, critique: &str) -> bool {
        self(critique)
    }
}

/// Reads a `NEEDS IMPROVEMENT: yes|no` field. A missing field means no.
///
/// Matching is case-insensitive and tolerates markdown emphasis around the
/// label and value (`**Needs Improvement:** Yes.`). The last field wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredField;

impl StructuredField {
    fn verdict(critique: &str) -> Option<bool> {
        let lower = critique.to_ascii_lowercase();
        let label = NEEDS_IMPROVEMENT_LABEL
            .trim_end_matches(':')
            .to_ascii_lowercase();

        for (idx, _) in lower.rmatch_indices(label.as_str()) {
            let after = &lower[idx + label.len()..];
            let after = after.trim_start_matches(|c: char| c == '*' || c == '_' || c == ' ');
            let Some(value) = after.strip_prefix(':') else {
                continue;
            };

            let mut lines = value.lines();
            let first = lines.next().unwrap_or_default();
            let token = first_word(first)
                .or_else(|| lines.find(|l| !l.trim().is_empty()).and_then(first_word));
            return Some(token == Some("yes"));
        }
        None
    }
}

fn first_word(line: &str) -> Option<&str> {
    line.split(|c: char| !c.is_ascii_alphabetic())
        .find(|w| !w.is_empty())
}

impl ImprovementPolicy for StructuredField {
    fn needs_improvement(&self, critique: &str) -> bool {
        Self::verdict(critique).unwrap_or(false)
    }
}

/// Improvement is needed unless the critique contains the approval phrase.
#[derive(Debug, Clone)]
pub struct MarkerPhrase {
    phrase: String,
}

impl MarkerPhrase {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into(),
        }
    }
}

impl Default for MarkerPhrase {
    fn default() -> Self {
        Self::new(NO_CRITIQUE_MARKER)
    }
}

impl ImprovementPolicy for MarkerPhrase {
    fn needs_improvement(&self, critique: &str) -> bool {
        !critique.contains(&self.phrase)
    }
}

/// The built-in policy for a config value.
pub fn policy_from_config(kind: CriticPolicyKind) -> Arc<dyn ImprovementPolicy> {
    match kind {
        CriticPolicyKind::Structured => Arc::new(StructuredField),
        CriticPolicyKind::Marker => Arc::new(MarkerPhrase::default()),
    }
}

/// The single user message the critic sees.
pub fn render_critique_request(query: &str, reply: &str) -> String {
    format!("USER QUERY:\n{query}\n\nAI RESPONSE:\n{reply}")
}

/// What a reflection step concluded.
#[derive(Debug, Clone, Default)]
pub struct CritiqueOutcome {
    pub needs_improvement: bool,
    /// `None` when reflection was skipped or the critic never answered
    pub critique: Option<String>,
}

/// Calls the critic model and turns its verdict into feedback.
#[derive(Clone)]
pub struct Critic {
    provider: Arc<dyn Provider>,
    settings: ModelSettings,
    system_prompt: String,
    policy: Arc<dyn ImprovementPolicy>,
    retry: RetryPolicy,
}

impl Critic {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            settings: ModelSettings::critic(),
            system_prompt: default_reflection_prompt(CriticPolicyKind::Structured).to_string(),
            policy: Arc::new(StructuredField),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ImprovementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Critique the latest reply. On "needs improvement" a feedback message
    /// is appended and the loop flag stays set; otherwise the log is left
    /// alone and the flag is cleared. Provider failures count as satisfied.
    pub async fn reflect(
        &self,
        log: &mut MessageLog,
        state: &mut LoopState,
        run: &RunContext<'_>,
    ) -> CritiqueOutcome {
        let iteration = state.iteration_count;

        let exchange = match (log.latest_exchange(), log.last()) {
            (Some((prompt, reply)), Some(last)) if last.role == Role::Assistant => {
                let query = log.original_query().unwrap_or(prompt);
                Some(render_critique_request(&query.content, &reply.content))
            }
            _ => None,
        };
        let Some(request_text) = exchange else {
            warn!(run_id = %run.run_id, "No assistant reply to reflect on");
            return self.skip(state, run, iteration, "no assistant reply to review");
        };

        run.emit(LoopEvent::ReflectionStarted {
            run_id: run.run_id.clone(),
            iteration,
        });

        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(request_text),
        ];
        let result = retry_with_backoff(
            &self.retry,
            || {
                let request = self.settings.request(messages.clone());
                async move { self.provider.complete(request).await }
            },
            |notice| {
                run.emit(LoopEvent::RetryScheduled {
                    run_id: run.run_id.clone(),
                    operation: LoopNode::Reflect,
                    attempt: notice.attempt,
                    base_delay_ms: millis(notice.base_delay),
                    delay_ms: millis(notice.delay),
                    error: notice.error.to_string(),
                })
            },
        )
        .await;

        let critique = match result {
            Ok(response) => response.message.content,
            Err(err) => {
                run.emit(LoopEvent::RetriesExhausted {
                    run_id: run.run_id.clone(),
                    operation: LoopNode::Reflect,
                    attempts: err.attempts,
                    error: err.last.to_string(),
                });
                return self.skip(state, run, iteration, &format!("critic failed: {}", err.last));
            }
        };

        let needs_improvement = self.policy.needs_improvement(&critique);
        run.emit(LoopEvent::CritiqueCompleted {
            run_id: run.run_id.clone(),
            iteration,
            needs_improvement,
            critique_preview: preview(&critique, 120),
        });

        if needs_improvement {
            log.push(Message::feedback(&critique));
        }
        state.needs_further_reflection = needs_improvement;

        CritiqueOutcome {
            needs_improvement,
            critique: Some(critique),
        }
    }

    fn skip(
        &self,
        state: &mut LoopState,
        run: &RunContext<'_>,
        iteration: u32,
        reason: &str,
    ) -> CritiqueOutcome {
        state.needs_further_reflection = false;
        run.emit(LoopEvent::ReflectionSkipped {
            run_id: run.run_id.clone(),
            iteration,
            reason: reason.to_string(),
        });
        CritiqueOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observers;
    use crate::retry::FixedJitter;
    use crate::test_helpers::{RecordingObserver, ScriptedProvider};
    use reflector_core::error::ProviderError;
    use std::time::Duration;

    fn answered_log() -> MessageLog {
        let mut log = MessageLog::seeded("sys", "What is 2+2?");
        log.push(Message::assistant("4."));
        log
    }

    #[test]
    fn structured_field_reads_yes_and_no() {
        let policy = StructuredField;
        assert!(policy.needs_improvement("REFLECTION: meh\nNEEDS IMPROVEMENT: yes"));
        assert!(!policy.needs_improvement("REFLECTION: fine\nNEEDS IMPROVEMENT: no"));
        assert!(policy.needs_improvement("5. **Needs Improvement:** Yes."));
        assert!(policy.needs_improvement("**NEEDS IMPROVEMENT**: YES, the answer is wrong"));
    }

    #[test]
    fn structured_field_value_on_next_line() {
        assert!(StructuredField.needs_improvement("NEEDS IMPROVEMENT:\n\n  yes\n"));
        assert!(!StructuredField.needs_improvement("NEEDS IMPROVEMENT:\nno"));
    }

    #[test]
    fn structured_field_missing_means_no() {
        assert!(!StructuredField.needs_improvement("No critique needed"));
        assert!(!StructuredField.needs_improvement("The response needs improvement overall"));
        assert!(!StructuredField.needs_improvement(""));
    }

    #[test]
    fn structured_field_last_label_wins() {
        let text = "NEEDS IMPROVEMENT: yes\n...on reflection...\nNEEDS IMPROVEMENT: no";
        assert!(!StructuredField.needs_improvement(text));
    }

    #[test]
    fn structured_field_does_not_match_words_containing_yes() {
        assert!(!StructuredField.needs_improvement("NEEDS IMPROVEMENT: yesterday's answer was fine"));
    }

    #[test]
    fn marker_phrase() {
        let policy = MarkerPhrase::default();
        assert!(!policy.needs_improvement("No critique needed"));
        assert!(!policy.needs_improvement("Looks right. No critique needed."));
        assert!(policy.needs_improvement("Add an example."));
    }

    #[test]
    fn closures_are_policies() {
        let always: Arc<dyn ImprovementPolicy> = Arc::new(|_: &str| true);
        assert!(always.needs_improvement("anything"));
    }

    #[test]
    fn policy_from_config_picks_variant() {
        let marker = policy_from_config(CriticPolicyKind::Marker);
        assert!(marker.needs_improvement("NEEDS IMPROVEMENT: no"));
        let structured = policy_from_config(CriticPolicyKind::Structured);
        assert!(!structured.needs_improvement("NEEDS IMPROVEMENT: no"));
    }

    #[test]
    fn critique_request_format() {
        assert_eq!(
            render_critique_request("What is 2+2?", "4."),
            "USER QUERY:\nWhat is 2+2?\n\nAI RESPONSE:\n4."
        );
    }

    #[tokio::test]
    async fn satisfied_critic_leaves_log_untouched() {
        let provider = Arc::new(ScriptedProvider::always("Fine.\nNEEDS IMPROVEMENT: no"));
        let critic = Critic::new(provider.clone());
        let observers = Observers::new();
        let run = RunContext::new("run-1", &observers);
        let mut log = answered_log();
        let mut state = LoopState::new(3);
        state.iteration_count = 1;

        let outcome = critic.reflect(&mut log, &mut state, &run).await;

        assert!(!outcome.needs_improvement);
        assert!(!state.needs_further_reflection);
        assert_eq!(log.len(), 3);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn unsatisfied_critic_appends_feedback() {
        let critique = "Show the working.\nNEEDS IMPROVEMENT: yes";
        let provider = Arc::new(ScriptedProvider::always(critique));
        let critic = Critic::new(provider);
        let observers = Observers::new();
        let run = RunContext::new("run-1", &observers);
        let mut log = answered_log();
        let mut state = LoopState::new(3);

        let outcome = critic.reflect(&mut log, &mut state, &run).await;

        assert!(outcome.needs_improvement);
        assert!(state.needs_further_reflection);
        let last = log.last().unwrap();
        assert!(last.is_feedback());
        assert_eq!(last.content, format!("FEEDBACK: {critique}"));
        let before = &log.messages()[log.len() - 2];
        assert_eq!(before.role, Role::Assistant);
    }

    #[tokio::test]
    async fn critic_request_is_isolated_from_transcript() {
        let provider = Arc::new(ScriptedProvider::always("NEEDS IMPROVEMENT: yes"));
        let critic = Critic::new(provider.clone()).with_system_prompt("judge");
        let observers = Observers::new();
        let run = RunContext::new("run-1", &observers);
        let mut log = answered_log();
        log.push(Message::feedback("earlier critique"));
        log.push(Message::assistant("Four."));
        let mut state = LoopState::new(3);

        critic.reflect(&mut log, &mut state, &run).await;

        let request = &provider.requests()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, "judge");
        assert_eq!(
            request.messages[1].content,
            "USER QUERY:\nWhat is 2+2?\n\nAI RESPONSE:\nFour."
        );
        assert_eq!(request.temperature, 0.2);
    }

    #[tokio::test]
    async fn no_assistant_message_skips() {
        let provider = Arc::new(ScriptedProvider::always("NEEDS IMPROVEMENT: yes"));
        let critic = Critic::new(provider.clone());
        let recorder = Arc::new(RecordingObserver::default());
        let mut observers = Observers::new();
        observers.push(recorder.clone());
        let run = RunContext::new("run-1", &observers);
        let mut log = MessageLog::seeded("sys", "q");
        let mut state = LoopState::new(3);

        let outcome = critic.reflect(&mut log, &mut state, &run).await;

        assert!(!outcome.needs_improvement);
        assert!(outcome.critique.is_none());
        assert_eq!(log.len(), 2);
        assert_eq!(provider.call_count(), 0);
        assert!(
            recorder
                .events()
                .iter()
                .any(|e| matches!(e, LoopEvent::ReflectionSkipped { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_critic_counts_as_satisfied() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::Timeout(
            "30s".into(),
        )));
        let critic = Critic::new(provider.clone()).with_retry_policy(
            RetryPolicy::new(1, Duration::from_millis(10)).with_jitter(Arc::new(FixedJitter(0.0))),
        );
        let observers = Observers::new();
        let run = RunContext::new("run-1", &observers);
        let mut log = answered_log();
        let mut state = LoopState::new(3);

        let outcome = critic.reflect(&mut log, &mut state, &run).await;

        assert!(!outcome.needs_improvement);
        assert!(!state.needs_further_reflection);
        assert_eq!(log.len(), 3);
        assert_eq!(provider.call_count(), 2);
    }
}
