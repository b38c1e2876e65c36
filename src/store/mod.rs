//! Persistence: checkpoints and memory.

mod checkpoint;
mod memory;

pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    CHECKPOINT_VERSION,
};
pub use memory::{
    tags, JsonMemoryStore, LongTermEntry, MemoryError, MemoryStore, MemoryWriteOutcome,
    SessionSummary, MIN_IMPORTANCE, MIN_LONG_TERM_CHARS,
};
