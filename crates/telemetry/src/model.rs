//! Data model for run traces and spans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// The whole run (query → final response).
    Run,
    /// One call to the primary model, retries included.
    Generation,
    /// One call to the critic, retries included.
    Reflection,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Generation => write!(f, "generation"),
            Self::Reflection => write!(f, "reflection"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique identifier.
    pub id: String,
    /// Parent span id (None for the run span).
    pub parent_id: Option<String>,
    /// What kind of work this represents.
    pub kind: SpanKind,
    /// Human-readable label.
    pub label: String,
    /// Which iteration this belongs to (0 for the run span).
    pub iteration: u32,
    /// When the span started.
    pub started_at: DateTime<Utc>,
    /// When the span ended (None if still running).
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds (computed on end).
    pub duration_ms: Option<u64>,
    /// Tokens reported by the provider.
    pub tokens: Option<u32>,
    /// Failed attempts that were retried.
    pub retries: u32,
    /// Whether the operation succeeded.
    pub success: Option<bool>,
    /// Arbitrary metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    /// Create a new span with the given kind and label.
    pub fn new(kind: SpanKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            label: label.into(),
            iteration: 0,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            tokens: None,
            retries: 0,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the parent span.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Attach a metadata value.
    pub fn annotate(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Mark the span as ended with the given success status.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All spans of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Unique trace id.
    pub id: String,
    /// Run this trace belongs to.
    pub run_id: String,
    /// Project name the trace is filed under.
    pub project: String,
    /// All finished spans, the run span last.
    pub spans: Vec<Span>,
    /// When the trace started.
    pub started_at: DateTime<Utc>,
    /// When the trace ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Run-level failure, if any.
    pub error: Option<String>,
}

impl Trace {
    /// Create a new trace for a run.
    pub fn new(run_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            project: project.into(),
            spans: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Add a span to this trace.
    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Mark the trace as complete.
    pub fn end(&mut self, error: Option<String>) {
        self.ended_at = Some(Utc::now());
        self.error = error;
    }

    /// The run span, once it has been closed.
    pub fn root(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.kind == SpanKind::Run)
    }

    /// Total tokens across all spans.
    pub fn total_tokens(&self) -> u32 {
        self.spans.iter().filter_map(|s| s.tokens).sum()
    }

    /// Total retries across all spans.
    pub fn total_retries(&self) -> u32 {
        self.spans.iter().map(|s| s.retries).sum()
    }

    pub fn generation_count(&self) -> usize {
        self.count(SpanKind::Generation)
    }

    pub fn reflection_count(&self) -> usize {
        self.count(SpanKind::Reflection)
    }

    fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }
}
