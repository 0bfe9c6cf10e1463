//! The reflection loop: generate a reply, have a critic review it, and
//! regenerate with the critique until the critic is satisfied or the
//! iteration cap is reached.
//!
//! 1. **Seed** a log with the system prompt and the user's query
//! 2. **Generate** a reply from the primary model over the whole log
//! 3. **Reflect**: the critic sees only the query and the latest reply
//! 4. **If improvement is needed**: append the critique as feedback, go to 2
//! 5. **Otherwise** return the latest reply
//!
//! Both model calls go through [`retry::retry_with_backoff`]; exhausted
//! retries degrade to a fallback reply or a "satisfied" verdict instead of
//! failing the run.

pub mod controller;
pub mod critic;
pub mod generator;
pub mod observer;
pub mod prompts;
pub mod retry;
pub mod state;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use controller::{RUN_FAILURE_RESPONSE, ReflectionAgent, RunOutcome, next_node};
pub use critic::{
    Critic, CritiqueOutcome, ImprovementPolicy, MarkerPhrase, StructuredField, policy_from_config,
};
pub use generator::{GENERATION_FALLBACK, GenerationOutcome, Generator, ModelSettings};
pub use observer::{Observers, TracingObserver};
pub use retry::{FixedJitter, JitterSource, RandomJitter, RetryError, RetryPolicy, retry_with_backoff};
pub use state::{LoopState, NO_RESPONSE, RunContext};
