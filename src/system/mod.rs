//! Host system probes

pub mod resources;

pub use resources::available_memory_bytes;
