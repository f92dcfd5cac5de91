//! Live generation: delta accumulation, per-message broadcast hubs and the
//! registry that owns them.

pub mod accumulator;
pub mod chunk;
pub mod hub;
pub mod registry;

pub use chunk::{Chunk, ChunkKind};
pub use hub::StreamHub;
pub use registry::StreamRegistry;
