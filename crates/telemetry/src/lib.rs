//! Run tracing for Reflector.
//!
//! A [`RunTracer`] observes the loop's events, groups them into one
//! [`Trace`] of spans per run (run, generations, reflections, retries) and
//! hands each finished trace to a [`TraceExporter`]. Tracing sits entirely
//! outside the loop's control flow.

pub mod exporter;
pub mod model;
pub mod tracer;

pub use exporter::{HttpExporter, LogExporter, MemoryExporter, TraceExporter, exporter_from_config};
pub use model::{Span, SpanKind, Trace};
pub use tracer::RunTracer;

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing endpoint configured without an API key")]
    MissingApiKey,

    #[error("trace export failed: {0}")]
    Export(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
