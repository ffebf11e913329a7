//! AI provider boundary for the autoflow engine.
//!
//! The engine never talks to a model provider directly. `ai_response` nodes
//! build an [`LlmRequest`] from a [`PromptTemplate`] rendered against the
//! execution context and hand it to whatever [`LlmBackend`] the embedding
//! application registers.

pub mod backend;
pub mod error;
pub mod prompt;

pub use backend::{LlmBackend, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
pub use error::LlmError;
pub use prompt::PromptTemplate;
