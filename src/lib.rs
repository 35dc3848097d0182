// Double-buffered audio output core
// Two period buffers alternate between a producer callback and the sound
// hardware, with a lock/unlock API that defers mixing without stalling the
// hardware's completion notifications.

// Module declarations
pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod hardware;

// Re-exports for convenience
pub use audio::{BufferIndex, ConversionGate, CycleStats, ProducerCallback, Strategy};
pub use config::{init_logging, LogLevel, OutputConfig, StrategyPreference};
pub use device::OutputDevice;
pub use error::{ErrorCode, OutputError, OutputErrorCodes};
pub use format::{FormatDescriptor, FormatRequest, SampleFormat};
pub use hardware::{AudioHost, HostCapabilities, SimulatedHost};
#[cfg(feature = "cpal-host")]
pub use hardware::CpalHost;
