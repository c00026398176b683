//! Prompt reuse and position maintenance
//!
//! [`PromptCache`] decides which previously processed chunks a request can
//! reuse; [`KvCache`] is the engine-side position store it keeps in sync.

pub mod kv;
pub mod prompt;

pub use kv::{
    compact, compact_window, tail_for_target, KvCache, Position, COMPACTION_THRESHOLD,
    DEFAULT_TARGET_USAGE,
};
pub use prompt::{CacheDiff, CacheEntry, PromptCache};
