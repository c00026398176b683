//! LLM inference
//!
//! This module handles all interaction with llama-cpp: model loading, the
//! execution context, sampling, and the session worker.

pub mod context;
pub mod engine;
pub mod model;
pub mod sampler;
pub mod streaming;

// Re-export main types for convenience
pub use context::ExecutionContext;
pub use engine::Session;
pub use model::{EngineHandle, ModelInfo, DEFAULT_CHAT_TEMPLATE, GGUF_MAGIC};
pub use sampler::{SamplerPlan, SamplerStage};
pub use streaming::{StreamToken, TokenStream};
