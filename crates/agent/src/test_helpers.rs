//! Shared test helpers for loop tests.

use reflector_core::error::ProviderError;
use reflector_core::event::{LoopEvent, RunObserver};
use reflector_core::message::Message;
use reflector_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A mock provider that plays back scripted results.
///
/// Each call takes the next entry; the last entry repeats forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn sequence(script: Vec<Result<String, ProviderError>>) -> Self {
        assert!(!script.is_empty(), "script needs at least one entry");
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        Self::sequence(vec![Ok(text.to_string())])
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::sequence(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::sequence(vec![Err(error)])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);

        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        };

        next.map(|text| ProviderResponse {
            message: Message::assistant(text),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model,
        })
    }
}

/// Panics on every call.
pub struct PanickingProvider;

#[async_trait::async_trait]
impl Provider for PanickingProvider {
    fn name(&self) -> &str {
        "panicking_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        panic!("provider exploded");
    }
}

/// Never answers.
pub struct HangingProvider;

#[async_trait::async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        "hanging_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

/// Keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LoopEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<LoopEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl RunObserver for RecordingObserver {
    fn on_event(&self, event: &LoopEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
