// OutputDevice - lifecycle and the application-facing lock/unlock API
//
// Owns one channel's worth of state: the buffer pair, the lock gate, the
// flags and the completion handler, all reached through a single
// Arc<OutputState>. Nothing is global; two devices share nothing.
//
// Open order matters:
// 1. negotiate the descriptor
// 2. select a strategy the host supports (before any allocation)
// 3. allocate buffers and the mixer
// 4. create the channel, then start the first cycle
//
// Close marks the device disabled before disposing the channel so a
// notification already in flight returns without touching the buffers.

use std::sync::Arc;

use log::{info, warn};

use crate::audio::buffer_pool::BufferPair;
use crate::audio::callback::{
    CompletionHandler, CycleStats, DoubleBufferHandler, OutputState, ResubmitHandler, Strategy,
};
use crate::audio::lock_gate::Disengaged;
use crate::audio::mixer::{ConversionGate, MixEngine, ProducerCallback, SignFlip};
use crate::config::{OutputConfig, StrategyPreference};
use crate::error::OutputError;
use crate::format::{FormatDescriptor, FormatRequest};
use crate::hardware::{AudioHost, ChannelRequest, SoundChannel};

/// An open double-buffered output channel.
pub struct OutputDevice {
    descriptor: FormatDescriptor,
    strategy: Strategy,
    state: Option<Arc<OutputState>>,
    channel: Option<Box<dyn SoundChannel>>,
}

impl OutputDevice {
    /// Open a channel and start playback.
    ///
    /// The producer is called once per period with a slice of exactly
    /// [`period_bytes`](Self::period_bytes) bytes. When the requested format
    /// needs one of the built-in sign conversions, the producer writes the
    /// requested format and the device converts it.
    pub fn open(
        host: &dyn AudioHost,
        request: FormatRequest,
        producer: ProducerCallback,
        config: &OutputConfig,
    ) -> Result<Self, OutputError> {
        Self::open_inner(host, request, producer, None, config)
    }

    /// Like [`open`](Self::open), but with a caller-supplied conversion gate
    /// used when the requested format differs from the hardware format.
    ///
    /// The gate is ignored when no conversion is needed.
    pub fn open_with_converter(
        host: &dyn AudioHost,
        request: FormatRequest,
        producer: ProducerCallback,
        converter: Box<dyn ConversionGate>,
        config: &OutputConfig,
    ) -> Result<Self, OutputError> {
        Self::open_inner(host, request, producer, Some(converter), config)
    }

    fn open_inner(
        host: &dyn AudioHost,
        request: FormatRequest,
        producer: ProducerCallback,
        converter: Option<Box<dyn ConversionGate>>,
        config: &OutputConfig,
    ) -> Result<Self, OutputError> {
        let descriptor = FormatDescriptor::negotiate(&request)?;

        let capabilities = host.capabilities();
        let strategy = config.strategy.select(&capabilities).ok_or_else(|| {
            OutputError::CapabilityUnavailable {
                feature: required_feature(config.strategy).to_string(),
            }
        })?;

        let buffers = Arc::new(BufferPair::allocate(
            descriptor.period_bytes,
            descriptor.frames,
        )?);

        let mut mixer = MixEngine::new(producer, descriptor.period_bytes);
        if descriptor.conversion_needed() {
            let gate = match converter {
                Some(gate) => gate,
                None => Box::new(SignFlip::for_descriptor(&descriptor).ok_or_else(|| {
                    OutputError::UnsupportedFormat {
                        reason: format!(
                            "no conversion from {} to {}",
                            descriptor.requested, descriptor.format
                        ),
                    }
                })?),
            };
            mixer = mixer.with_conversion(gate)?;
        } else if converter.is_some() {
            warn!(
                "[OutputDevice] {} needs no conversion, ignoring the supplied converter",
                descriptor.format
            );
        }

        let state = Arc::new(OutputState::new(descriptor, Arc::clone(&buffers), mixer));
        let handler: Arc<dyn CompletionHandler> = match strategy {
            Strategy::Resubmit => Arc::new(ResubmitHandler::new(
                Arc::clone(&state),
                config.prime_buffers,
            )),
            Strategy::DoubleBuffer => Arc::new(DoubleBufferHandler::new(
                Arc::clone(&state),
                config.prime_buffers,
            )),
        };

        let channel = host.new_channel(ChannelRequest {
            descriptor,
            layout: descriptor.layout(),
            queue_len: config.command_queue_len,
            buffers,
            handler: Arc::clone(&handler),
        })?;

        state.flags().set_running(true);
        if let Err(err) = handler.start(channel.as_ref()) {
            state.flags().set_running(false);
            state.flags().set_enabled(false);
            channel.dispose();
            warn!("[OutputDevice] start failed, channel disposed: {}", err);
            return Err(err);
        }

        info!(
            "[OutputDevice] opened: {} -> {}, {} ch, {} Hz, {} frames, {} bytes/period, {:?}",
            descriptor.requested,
            descriptor.format,
            descriptor.channels,
            descriptor.sample_rate,
            descriptor.frames,
            descriptor.period_bytes,
            strategy
        );

        Ok(Self {
            descriptor,
            strategy,
            state: Some(state),
            channel: Some(channel),
        })
    }

    fn state(&self) -> Result<&Arc<OutputState>, OutputError> {
        self.state.as_ref().ok_or(OutputError::NotOpen)
    }

    /// Suspend mixing. Notifications keep arriving and defer their mix.
    ///
    /// Never blocks. Returns the parked fault, if playback has failed; the
    /// engagement is counted either way.
    pub fn lock(&self) -> Result<(), OutputError> {
        let state = self.state()?;
        let depth = state.gate().engage();
        tracing::trace!(depth, "output locked");
        parked(state)
    }

    /// Resume mixing.
    ///
    /// The unlock that fully disengages pays every deferred mix before
    /// returning, including one a notification recorded while the previous
    /// payment ran. The gate stays engaged until nothing is owed.
    pub fn unlock(&self) -> Result<(), OutputError> {
        let state = self.state()?;
        let mut failure = None;
        loop {
            match state.gate().disengage()? {
                Disengaged::StillEngaged { depth } => {
                    tracing::trace!(depth, "output still locked");
                    break;
                }
                Disengaged::Released => break,
                Disengaged::Owed { index } => {
                    tracing::trace!(?index, "paying deferred mix");
                    if let Err(err) = state.mix_blocking(index) {
                        failure.get_or_insert(err);
                    }
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => parked(state),
        }
    }

    /// While paused, periods are played as silence and the producer is not
    /// called.
    pub fn set_paused(&self, paused: bool) {
        if let Some(state) = &self.state {
            state.flags().set_paused(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| state.flags().is_paused())
            .unwrap_or(false)
    }

    pub fn period_bytes(&self) -> usize {
        self.descriptor.period_bytes
    }

    pub fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Outstanding `lock` calls.
    pub fn lock_depth(&self) -> u32 {
        self.state
            .as_ref()
            .map(|state| state.gate().depth())
            .unwrap_or(0)
    }

    /// Deferred mixes currently owed.
    pub fn pending_mixes(&self) -> u32 {
        self.state
            .as_ref()
            .map(|state| state.gate().pending())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CycleStats {
        self.state
            .as_ref()
            .map(|state| state.stats())
            .unwrap_or_default()
    }

    /// The parked playback fault, if any.
    pub fn fault(&self) -> Option<OutputError> {
        self.state.as_ref().and_then(|state| state.fault())
    }

    /// Stop playback, dispose the channel and release both buffers.
    ///
    /// Blocks until an in-flight notification has returned. Safe to call in
    /// any state; a second call does nothing. Returns the parked fault if
    /// playback had failed.
    pub fn close(&mut self) -> Result<(), OutputError> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };

        state.flags().set_running(false);
        state.flags().set_enabled(false);
        if let Some(channel) = self.channel.take() {
            channel.dispose();
        }

        let stats = state.stats();
        let fault = state.fault();
        drop(state);

        info!(
            "[OutputDevice] closed after {} notifications ({} deferred mixes, {} overruns)",
            stats.notifications, stats.deferred_mixes, stats.overruns
        );

        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("[OutputDevice] dropped with playback fault: {}", err);
        }
    }
}

fn parked(state: &OutputState) -> Result<(), OutputError> {
    match state.fault() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn required_feature(preference: StrategyPreference) -> &'static str {
    match preference {
        StrategyPreference::Auto => "double buffering or callback commands",
        StrategyPreference::Resubmit => "callback commands",
        StrategyPreference::DoubleBuffer => "native double buffering",
    }
}

#[cfg(test)]
mod tests;
