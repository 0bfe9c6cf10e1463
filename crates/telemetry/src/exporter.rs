//! Where finished traces go.

use crate::TelemetryError;
use crate::model::Trace;
use reflector_config::TracingConfig;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Receives each trace once its run has finished.
///
/// Called from the loop's task, so implementations must not block.
pub trait TraceExporter: Send + Sync {
    fn export(&self, trace: Trace);
}

/// Writes a one-line summary of every trace through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

impl TraceExporter for LogExporter {
    fn export(&self, trace: Trace) {
        let duration_ms = trace.root().and_then(|s| s.duration_ms).unwrap_or(0);
        info!(
            run_id = %trace.run_id,
            project = %trace.project,
            generations = trace.generation_count(),
            reflections = trace.reflection_count(),
            retries = trace.total_retries(),
            tokens = trace.total_tokens(),
            duration_ms,
            error = trace.error.as_deref().unwrap_or(""),
            "Run trace"
        );
    }
}

/// Keeps traces in memory.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    traces: Mutex<Vec<Trace>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TraceExporter for MemoryExporter {
    fn export(&self, trace: Trace) {
        self.traces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(trace);
    }
}

/// Posts traces to a collector at `{endpoint}/runs`.
///
/// Each export is spawned on the current tokio runtime; failures are logged
/// and dropped.
#[derive(Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for HttpExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExporter")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***")
            .finish()
    }
}

impl HttpExporter {
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self, TelemetryError> {
        if api_key.trim().is_empty() {
            return Err(TelemetryError::MissingApiKey);
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| TelemetryError::Export(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn runs_url(&self) -> String {
        format!("{}/runs", self.endpoint)
    }

    /// Send one trace and wait for the collector's answer.
    pub async fn send(&self, trace: &Trace) -> Result<(), TelemetryError> {
        let body = serde_json::json!({
            "project": trace.project,
            "trace": serde_json::to_value(trace)?,
        });

        let response = self
            .client
            .post(self.runs_url())
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TelemetryError::Export(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Export(format!("collector returned {status}: {text}")));
        }
        debug!(run_id = %trace.run_id, "Trace exported");
        Ok(())
    }
}

impl TraceExporter for HttpExporter {
    fn export(&self, trace: Trace) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %trace.run_id, "No async runtime, dropping trace");
            return;
        };
        let exporter = self.clone();
        handle.spawn(async move {
            if let Err(e) = exporter.send(&trace).await {
                warn!(run_id = %trace.run_id, error = %e, "Trace export failed");
            }
        });
    }
}

/// The exporter configured by `[tracing]`, or `None` when tracing is off.
///
/// With no endpoint, traces are only logged.
pub fn exporter_from_config(
    config: &TracingConfig,
) -> Result<Option<Arc<dyn TraceExporter>>, TelemetryError> {
    if !config.enabled {
        return Ok(None);
    }
    match &config.endpoint {
        Some(endpoint) => {
            let api_key = config.api_key.as_deref().unwrap_or_default();
            Ok(Some(Arc::new(HttpExporter::new(endpoint, api_key)?)))
        }
        None => Ok(Some(Arc::new(LogExporter))),
    }
}
