//! Loop events and the observer seam.
//!
//! The loop never logs or exports anything itself. It emits [`LoopEvent`]s
//! to whatever [`RunObserver`]s the caller injected; observers must not
//! influence control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// The nodes of the generate/reflect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopNode {
    Generate,
    Reflect,
    Done,
}

impl std::fmt::Display for LoopNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Reflect => write!(f, "reflect"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Everything observable about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    /// A run began with a freshly seeded log
    RunStarted {
        run_id: String,
        query_preview: String,
        max_iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// The primary model is about to be called
    GenerationStarted { run_id: String, iteration: u32 },

    /// A reply was appended (possibly the fallback apology)
    GenerationCompleted {
        run_id: String,
        iteration: u32,
        fallback: bool,
        tokens_used: Option<u32>,
    },

    /// The critic is about to be called
    ReflectionStarted { run_id: String, iteration: u32 },

    /// The critic answered and its verdict was parsed
    CritiqueCompleted {
        run_id: String,
        iteration: u32,
        needs_improvement: bool,
        critique_preview: String,
    },

    /// Reflection was a no-op (missing preconditions or critic failure)
    ReflectionSkipped {
        run_id: String,
        iteration: u32,
        reason: String,
    },

    /// A call failed and will be retried after `delay_ms`
    RetryScheduled {
        run_id: String,
        operation: LoopNode,
        attempt: u32,
        base_delay_ms: u64,
        delay_ms: u64,
        error: String,
    },

    /// A call failed on its final allowed attempt
    RetriesExhausted {
        run_id: String,
        operation: LoopNode,
        attempts: u32,
        error: String,
    },

    /// The controller moved between nodes
    Transition {
        run_id: String,
        from: LoopNode,
        to: LoopNode,
    },

    /// The run ended, successfully or not
    RunFinished {
        run_id: String,
        iterations: u32,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl LoopEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::GenerationStarted { run_id, .. }
            | Self::GenerationCompleted { run_id, .. }
            | Self::ReflectionStarted { run_id, .. }
            | Self::CritiqueCompleted { run_id, .. }
            | Self::ReflectionSkipped { run_id, .. }
            | Self::RetryScheduled { run_id, .. }
            | Self::RetriesExhausted { run_id, .. }
            | Self::Transition { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Receives loop events. Implementations must be cheap and non-blocking.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &LoopEvent);
}

impl<F> RunObserver for F
where
    F: Fn(&LoopEvent) + Send + Sync,
{
    fn on_event(&self, event: &LoopEvent) {
        self(event)
    }
}

/// A broadcast-based event bus for loop events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub, so a server can
/// fan events out to any number of listeners without the loop knowing.
pub struct EventBus {
    sender: broadcast::Sender<Arc<LoopEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: LoopEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LoopEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RunObserver for EventBus {
    fn on_event(&self, event: &LoopEvent) {
        self.publish(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.on_event(&LoopEvent::GenerationStarted {
            run_id: "r1".into(),
            iteration: 1,
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            LoopEvent::GenerationStarted { run_id, iteration } => {
                assert_eq!(run_id, "r1");
                assert_eq!(*iteration, 1);
            }
            other => panic!("Expected GenerationStarted, got {other:?}"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(LoopEvent::ReflectionSkipped {
            run_id: "r1".into(),
            iteration: 1,
            reason: "no subscribers".into(),
        });
    }

    #[test]
    fn closures_are_observers() {
        let seen = Mutex::new(Vec::new());
        let observer = |e: &LoopEvent| seen.lock().unwrap().push(e.run_id().to_string());
        observer.on_event(&LoopEvent::Transition {
            run_id: "abc".into(),
            from: LoopNode::Generate,
            to: LoopNode::Reflect,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(LoopEvent::Transition {
            run_id: "abc".into(),
            from: LoopNode::Reflect,
            to: LoopNode::Done,
        })
        .unwrap();
        assert_eq!(json["event"], "transition");
        assert_eq!(json["to"], "done");
    }
}
