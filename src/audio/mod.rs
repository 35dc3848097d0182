// Audio module - the double-buffer protocol: buffers, lock gate, mixing and
// completion handling

pub mod buffer_pool;
pub mod callback;
pub mod lock_gate;
pub mod mixer;

// Re-export commonly used types for convenience
pub use buffer_pool::{BufferIndex, BufferPair, PlaybackBuffer};
pub use callback::{
    CompletionHandler, CycleStats, DoubleBufferHandler, OutputState, ResubmitHandler, Strategy,
};
pub use lock_gate::{LockGate, MAX_DEFERRED_MIXES};
pub use mixer::{ConversionGate, MixEngine, ProducerCallback, SignFlip};
