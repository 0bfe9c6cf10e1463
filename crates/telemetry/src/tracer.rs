//! Builds a [`Trace`] per run from loop events.

use crate::TelemetryError;
use crate::exporter::{TraceExporter, exporter_from_config};
use crate::model::{Span, SpanKind, Trace};
use reflector_config::TracingConfig;
use reflector_core::event::{LoopEvent, RunObserver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct ActiveRun {
    trace: Trace,
    root: Span,
    open: Option<Span>,
}

impl ActiveRun {
    fn start(&mut self, kind: SpanKind, label: &str, iteration: u32) {
        self.close_dangling();
        self.open = Some(
            Span::new(kind, label)
                .with_parent(&self.root.id)
                .with_iteration(iteration),
        );
    }

    /// Close the open span, or a zero-length one if none was open.
    fn close(
        &mut self,
        kind: SpanKind,
        label: &str,
        iteration: u32,
        success: bool,
        fill: impl FnOnce(&mut Span),
    ) {
        let mut span = self.open.take().unwrap_or_else(|| {
            Span::new(kind, label)
                .with_parent(&self.root.id)
                .with_iteration(iteration)
        });
        fill(&mut span);
        span.end(success);
        self.trace.add_span(span);
    }

    fn close_dangling(&mut self) {
        if let Some(mut span) = self.open.take() {
            span.end(false);
            self.trace.add_span(span);
        }
    }
}

/// Observer that turns each run's events into a span trace and hands the
/// trace to an exporter when the run finishes.
pub struct RunTracer {
    project: String,
    exporter: Arc<dyn TraceExporter>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl RunTracer {
    pub fn new(project: impl Into<String>, exporter: Arc<dyn TraceExporter>) -> Self {
        Self {
            project: project.into(),
            exporter,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The tracer configured by `[tracing]`, or `None` when tracing is off.
    pub fn from_config(config: &TracingConfig) -> Result<Option<Self>, TelemetryError> {
        Ok(exporter_from_config(config)?.map(|exporter| Self::new(&config.project, exporter)))
    }

    /// Runs that have started but not finished.
    pub fn active_runs(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_run(&self, run_id: &str, f: impl FnOnce(&mut ActiveRun)) {
        if let Some(run) = self.lock().get_mut(run_id) {
            f(run);
        }
    }
}

impl RunObserver for RunTracer {
    fn on_event(&self, event: &LoopEvent) {
        match event {
            LoopEvent::RunStarted {
                run_id,
                query_preview,
                max_iterations,
                ..
            } => {
                let mut root = Span::new(SpanKind::Run, "reflection_run");
                root.annotate("query", query_preview.as_str());
                root.annotate("max_iterations", *max_iterations);
                let run = ActiveRun {
                    trace: Trace::new(run_id, &self.project),
                    root,
                    open: None,
                };
                self.lock().insert(run_id.clone(), run);
            }
            LoopEvent::GenerationStarted { run_id, iteration } => {
                self.with_run(run_id, |run| run.start(SpanKind::Generation, "generate", *iteration))
            }
            LoopEvent::ReflectionStarted { run_id, iteration } => {
                self.with_run(run_id, |run| run.start(SpanKind::Reflection, "reflect", *iteration))
            }
            LoopEvent::RetryScheduled { run_id, .. } => self.with_run(run_id, |run| {
                if let Some(span) = run.open.as_mut() {
                    span.retries += 1;
                }
            }),
            LoopEvent::RetriesExhausted {
                run_id,
                attempts,
                error,
                ..
            } => self.with_run(run_id, |run| {
                if let Some(span) = run.open.as_mut() {
                    span.annotate("attempts", *attempts);
                    span.annotate("error", error.as_str());
                }
            }),
            LoopEvent::GenerationCompleted {
                run_id,
                iteration,
                fallback,
                tokens_used,
            } => self.with_run(run_id, |run| {
                run.close(SpanKind::Generation, "generate", *iteration, !fallback, |span| {
                    span.tokens = *tokens_used;
                    span.annotate("fallback", *fallback);
                })
            }),
            LoopEvent::CritiqueCompleted {
                run_id,
                iteration,
                needs_improvement,
                critique_preview,
            } => self.with_run(run_id, |run| {
                run.close(SpanKind::Reflection, "reflect", *iteration, true, |span| {
                    span.annotate("needs_improvement", *needs_improvement);
                    span.annotate("critique", critique_preview.as_str());
                })
            }),
            LoopEvent::ReflectionSkipped {
                run_id,
                iteration,
                reason,
            } => self.with_run(run_id, |run| {
                run.close(SpanKind::Reflection, "reflect", *iteration, false, |span| {
                    span.annotate("skipped", reason.as_str());
                })
            }),
            LoopEvent::Transition { .. } => {}
            LoopEvent::RunFinished {
                run_id,
                iterations,
                error,
                ..
            } => {
                let Some(mut run) = self.lock().remove(run_id) else {
                    return;
                };
                run.close_dangling();
                let ActiveRun {
                    mut trace,
                    mut root,
                    ..
                } = run;
                root.annotate("iterations", *iterations);
                root.end(error.is_none());
                trace.add_span(root);
                trace.end(error.clone());
                self.exporter.export(trace);
            }
        }
    }
}
