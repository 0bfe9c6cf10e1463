//! Per-run mutable state.

use crate::observer::Observers;
use reflector_core::event::LoopEvent;
use reflector_core::message::MessageLog;

/// Returned when a run ends without any assistant reply.
pub const NO_RESPONSE: &str = "No response generated.";

/// Counters and flags for one run. Created fresh by every `run` call.
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Generator invocations so far
    pub iteration_count: u32,
    /// Cleared by the critic once it is satisfied (or fails)
    pub needs_further_reflection: bool,
    /// Hard cap on generator invocations
    pub max_iterations: u32,
}

impl LoopState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration_count: 0,
            needs_further_reflection: true,
            max_iterations: max_iterations.max(1),
        }
    }

    /// The user-visible answer: the last assistant reply in the log.
    pub fn terminal_response(&self, log: &MessageLog) -> String {
        log.last_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| NO_RESPONSE.to_string())
    }
}

/// Identity of a run plus the sinks its events go to.
pub struct RunContext<'a> {
    pub run_id: String,
    pub observers: &'a Observers,
}

impl<'a> RunContext<'a> {
    pub fn new(run_id: impl Into<String>, observers: &'a Observers) -> Self {
        Self {
            run_id: run_id.into(),
            observers,
        }
    }

    pub fn emit(&self, event: LoopEvent) {
        self.observers.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflector_core::message::Message;

    #[test]
    fn fresh_state_wants_reflection() {
        let state = LoopState::new(3);
        assert_eq!(state.iteration_count, 0);
        assert!(state.needs_further_reflection);
        assert_eq!(state.max_iterations, 3);
    }

    #[test]
    fn zero_cap_is_raised_to_one() {
        assert_eq!(LoopState::new(0).max_iterations, 1);
    }

    #[test]
    fn terminal_response_uses_last_reply() {
        let state = LoopState::new(3);
        let mut log = MessageLog::seeded("sys", "q");
        assert_eq!(state.terminal_response(&log), NO_RESPONSE);

        log.push(Message::assistant("A"));
        log.push(Message::feedback("more"));
        assert_eq!(state.terminal_response(&log), "A");
    }
}
