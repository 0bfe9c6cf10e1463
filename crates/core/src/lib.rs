//! # Reflector Core
//!
//! Domain types, traits, and error definitions for the Reflector
//! generate-then-critique loop. This crate has **no framework dependencies**:
//! it defines the conversation model, the model-backend seam, and the
//! observability events that every other crate builds on.
//!
//! ## Design Philosophy
//!
//! The model backend is a trait here and nothing more. Implementations live
//! in `reflector-providers`, the loop lives in `reflector-agent`. This keeps
//! the loop testable against scripted providers and lets the HTTP client be
//! swapped via configuration.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result};
pub use event::{EventBus, LoopEvent, LoopNode, RunObserver};
pub use message::{FEEDBACK_PREFIX, Message, MessageLog, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, Usage};
