//! Event fan-out and the `tracing` renderer.

use reflector_core::event::{LoopEvent, RunObserver};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The set of observers attached to an agent.
#[derive(Clone, Default)]
pub struct Observers {
    sinks: Vec<Arc<dyn RunObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn RunObserver>) {
        self.sinks.push(observer);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn emit(&self, event: &LoopEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}

/// Renders loop events as `tracing` records.
///
/// Progress goes to `info` when verbose and `debug` otherwise; retries and
/// skipped reflections are always `warn`.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    verbose: bool,
}

impl TracingObserver {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn progress(&self, run_id: &str, message: String) {
        if self.verbose {
            info!(run_id = %run_id, "{message}");
        } else {
            debug!(run_id = %run_id, "{message}");
        }
    }
}

impl RunObserver for TracingObserver {
    fn on_event(&self, event: &LoopEvent) {
        match event {
            LoopEvent::RunStarted {
                run_id,
                query_preview,
                max_iterations,
                ..
            } => self.progress(
                run_id,
                format!("User query: {query_preview} (max {max_iterations} iterations)"),
            ),
            LoopEvent::GenerationStarted { run_id, iteration } => {
                self.progress(run_id, format!("Generating response (iteration {iteration})"))
            }
            LoopEvent::GenerationCompleted {
                run_id,
                iteration,
                fallback: true,
                ..
            } => warn!(run_id = %run_id, iteration, "Generation failed, using fallback reply"),
            LoopEvent::GenerationCompleted {
                run_id, iteration, ..
            } => self.progress(run_id, format!("Response #{iteration} generated")),
            LoopEvent::ReflectionStarted { run_id, iteration } => {
                self.progress(run_id, format!("Reflecting on response #{iteration}"))
            }
            LoopEvent::CritiqueCompleted {
                run_id,
                needs_improvement,
                critique_preview,
                ..
            } => self.progress(
                run_id,
                format!("Critique (needs improvement: {needs_improvement}): {critique_preview}"),
            ),
            LoopEvent::ReflectionSkipped {
                run_id, reason, ..
            } => warn!(run_id = %run_id, reason = %reason, "Reflection skipped"),
            LoopEvent::RetryScheduled {
                run_id,
                operation,
                attempt,
                delay_ms,
                error,
                ..
            } => warn!(
                run_id = %run_id,
                operation = %operation,
                attempt,
                delay_ms,
                error = %error,
                "Call failed, retrying"
            ),
            LoopEvent::RetriesExhausted {
                run_id,
                operation,
                attempts,
                error,
            } => warn!(
                run_id = %run_id,
                operation = %operation,
                attempts,
                error = %error,
                "All attempts failed"
            ),
            LoopEvent::Transition { run_id, from, to } => {
                debug!(run_id = %run_id, from = %from, to = %to, "Transition")
            }
            LoopEvent::RunFinished {
                run_id,
                iterations,
                error: Some(error),
                ..
            } => warn!(run_id = %run_id, iterations, error = %error, "Run failed"),
            LoopEvent::RunFinished {
                run_id, iterations, ..
            } => self.progress(run_id, format!("Run finished after {iterations} iteration(s)")),
        }
    }
}

/// Truncate text for log previews without splitting a character.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
