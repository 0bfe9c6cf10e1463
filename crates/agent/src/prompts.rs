//! Default system prompts for the primary model and the critic.

use reflector_config::CriticPolicyKind;

pub const DEFAULT_MAIN_PROMPT: &str = "\
You are a helpful AI assistant. Give accurate, clear and useful answers to the user's questions.
Think about what is being asked before answering, and prefer concrete examples and structured explanations where they help.
If you are unsure about something, say so instead of guessing.
If the question is ambiguous, state how you are interpreting it before answering in detail.
When you receive a message starting with \"FEEDBACK:\", it is a review of your previous answer. Rewrite the answer to address it.";

const STRUCTURED_REFLECTION_PROMPT: &str = "\
You review an AI assistant's answer to a user's question.

Reply with these sections:
REFLECTION: an assessment of the answer's accuracy, clarity, relevance and completeness.
STRENGTHS: what the answer does well.
WEAKNESSES: where the answer falls short.
SUGGESTIONS: specific changes that would improve it.
NEEDS IMPROVEMENT: yes or no. Answer \"yes\" only if the answer needs significant changes.

Keep the feedback specific and constructive.";

const MARKER_REFLECTION_PROMPT: &str = "\
You review an AI assistant's answer to a user's question.

If the answer is accurate, clear and complete, reply with exactly: No critique needed
Otherwise list the specific problems and how to fix them. Keep the feedback specific and constructive.";

/// The critic prompt that matches how its verdict will be parsed.
pub fn default_reflection_prompt(kind: CriticPolicyKind) -> &'static str {
    match kind {
        CriticPolicyKind::Structured => STRUCTURED_REFLECTION_PROMPT,
        CriticPolicyKind::Marker => MARKER_REFLECTION_PROMPT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_prompt_asks_for_the_verdict_field() {
        let prompt = default_reflection_prompt(CriticPolicyKind::Structured);
        assert!(prompt.contains("NEEDS IMPROVEMENT:"));
    }

    #[test]
    fn marker_prompt_names_the_marker() {
        let prompt = default_reflection_prompt(CriticPolicyKind::Marker);
        assert!(prompt.contains(crate::critic::NO_CRITIQUE_MARKER));
    }
}
