//! LLM Provider implementations for Reflector.
//!
//! All providers implement the `reflector_core::Provider` trait.
//! The router builds the primary and critic handles from configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{ModelHandles, build_from_config, default_base_url};
