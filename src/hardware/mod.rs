//! Host abstractions the output core drives.
//!
//! The core never talks to a sound API directly. It asks an [`AudioHost`]
//! for a [`SoundChannel`], hands it the buffer pair and a completion handler,
//! and from then on only issues [`SoundCommand`]s. The host calls the handler
//! back from its own notification context.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::buffer_pool::{BufferIndex, BufferPair};
use crate::audio::callback::CompletionHandler;
use crate::error::OutputError;
use crate::format::{ChannelLayout, FormatDescriptor};

pub mod simulated;
pub mod tap;

#[cfg(feature = "cpal-host")]
mod cpal_host;
#[cfg(feature = "cpal-host")]
pub use cpal_host::CpalHost;

pub use simulated::{ChannelEvent, SimulatedClock, SimulatedHost};
pub use tap::{PlaybackTap, PlayedPeriod, TapChannels, TapReader, TapWriter};

/// Commands a channel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCommand {
    /// Start playing this buffer immediately.
    Buffer(BufferIndex),
    /// Notify the handler, with this buffer as payload, once everything
    /// queued before this command has finished playing.
    CallBack(BufferIndex),
    /// Hand both buffers to the host's native double-buffer primitive.
    PlayDoubleBuffer,
}

/// An open hardware channel.
pub trait SoundChannel: Send + Sync {
    /// Queue a command. Must not block; called from the notification context.
    fn do_command(&self, command: SoundCommand) -> Result<(), OutputError>;

    /// Stop playback and release the channel.
    ///
    /// Blocks until any in-flight notification has returned. No notification
    /// is delivered after this returns. Calling it twice is a no-op.
    fn dispose(&self);
}

/// Feature probe results reported by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// Sound manager major version.
    pub manager_major: u8,
    /// The play-double-buffer attribute.
    pub play_double_buffer: bool,
    /// Apple Sound Chip attribute, which implies double buffering on
    /// managers older than version 3.
    pub has_asc: bool,
    /// Buffer and callback commands can be issued from the notification
    /// context.
    pub callback_commands: bool,
}

impl HostCapabilities {
    /// Whether the native double-buffer primitive can be used.
    pub fn supports_double_buffer(&self) -> bool {
        if self.manager_major >= 3 {
            self.play_double_buffer
        } else {
            self.has_asc
        }
    }

    /// Whether the resubmission strategy can be used.
    pub fn supports_resubmit(&self) -> bool {
        self.callback_commands
    }
}

/// Everything a host needs to build a channel.
pub struct ChannelRequest {
    pub descriptor: FormatDescriptor,
    pub layout: ChannelLayout,
    pub queue_len: usize,
    pub buffers: Arc<BufferPair>,
    pub handler: Arc<dyn CompletionHandler>,
}

/// A sound subsystem able to open output channels.
pub trait AudioHost: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;

    fn new_channel(&self, request: ChannelRequest) -> Result<Box<dyn SoundChannel>, OutputError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(major: u8, double: bool, asc: bool) -> HostCapabilities {
        HostCapabilities {
            manager_major: major,
            play_double_buffer: double,
            has_asc: asc,
            callback_commands: false,
        }
    }

    #[test]
    fn test_double_buffer_probe_modern_manager() {
        assert!(caps(3, true, false).supports_double_buffer());
        assert!(!caps(3, false, true).supports_double_buffer());
    }

    #[test]
    fn test_double_buffer_probe_legacy_manager() {
        assert!(caps(2, false, true).supports_double_buffer());
        assert!(!caps(2, true, false).supports_double_buffer());
    }
}
