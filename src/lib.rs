//! kvcache-client
//!
//! Client layer around llama.cpp that reuses previously computed attention
//! state across the turns of a conversation.

pub mod cache;
pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod system;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheDiff, CacheEntry, KvCache, PromptCache};
pub use config::{SessionConfig, StructuredOutput};
pub use error::{InferenceError, Result};
pub use inference::{Session, TokenStream};
pub use types::{Attachment, MessageChunk};
