//! Shared data types

pub mod message;

pub use message::{render_chatml, Attachment, Message, MessageChunk, Role};
