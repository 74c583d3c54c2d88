//! Bounded in-memory history
//!
//! Two stores: the circular observation buffer (sequence-indexed window with
//! checkpoints) and the asset buffer (LRU keyed by asset id). Both are plain
//! single-threaded structures; the agent wraps each in its own exclusive
//! lock, which is the lock the concurrency model names.

pub mod assets;
pub mod checkpoint;
pub mod circular;

pub use assets::AssetBuffer;
pub use checkpoint::Checkpoint;
pub use circular::CircularBuffer;
