//! Mix engine - runs the producer callback into a playback buffer
//!
//! The engine owns the application's producer callback and, when the format
//! was coerced at open time, the conversion gate plus its scratch buffer.
//! It never looks at the lock gate: callers only invoke [`MixEngine::mix`]
//! when they own the target buffer and are allowed to mix.

use log::trace;

use crate::audio::buffer_pool::PlaybackBuffer;
use crate::error::OutputError;
use crate::format::{FormatDescriptor, SampleFormat};

/// Application callback that fills exactly `buffer.len()` bytes.
///
/// User context is whatever the closure captures.
pub type ProducerCallback = Box<dyn FnMut(&mut [u8]) + Send>;

/// Sample-format transcoding step between producer output and hardware
/// layout.
///
/// The producer writes `source_len()` bytes into the front of the scratch
/// buffer; `convert` transforms them in place and returns the converted
/// length, which must equal the period length.
pub trait ConversionGate: Send {
    /// Bytes the producer writes per period before conversion.
    fn source_len(&self) -> usize;

    /// Scratch bytes needed to hold both the source and the converted data.
    fn scratch_len(&self) -> usize {
        self.source_len()
    }

    /// Convert `scratch[..source_len()]` in place. Returns the converted
    /// length.
    fn convert(&mut self, scratch: &mut [u8]) -> usize;
}

/// Built-in gate for the fixed coercion table.
///
/// S8 → U8 and U16 → S16 only differ in the sign bit, so conversion flips
/// the top bit of every sample's most significant byte and leaves the length
/// unchanged.
#[derive(Debug, Clone)]
pub struct SignFlip {
    len: usize,
    /// Byte offset of the most significant byte within a sample.
    msb_offset: usize,
    stride: usize,
}

impl SignFlip {
    /// Gate for converting `from` into `to`, if that pair is in the table.
    pub fn between(from: SampleFormat, to: SampleFormat, period_bytes: usize) -> Option<Self> {
        if from == to || from.coerce() != to {
            return None;
        }
        let stride = to.bytes_per_sample();
        let msb_offset = if stride == 2 && !to.is_big_endian() {
            1
        } else {
            0
        };
        Some(Self {
            len: period_bytes,
            msb_offset,
            stride,
        })
    }

    /// Gate for the conversion a negotiated descriptor implies.
    pub fn for_descriptor(descriptor: &FormatDescriptor) -> Option<Self> {
        Self::between(descriptor.requested, descriptor.format, descriptor.period_bytes)
    }
}

impl ConversionGate for SignFlip {
    fn source_len(&self) -> usize {
        self.len
    }

    fn convert(&mut self, scratch: &mut [u8]) -> usize {
        let len = self.len.min(scratch.len());
        for sample in scratch[..len].chunks_exact_mut(self.stride) {
            sample[self.msb_offset] ^= 0x80;
        }
        len
    }
}

struct Conversion {
    gate: Box<dyn ConversionGate>,
    scratch: Vec<u8>,
}

/// Producer callback plus optional conversion, sized for one period.
pub struct MixEngine {
    producer: ProducerCallback,
    conversion: Option<Conversion>,
    period_bytes: usize,
    mixes: u64,
}

impl MixEngine {
    pub fn new(producer: ProducerCallback, period_bytes: usize) -> Self {
        Self {
            producer,
            conversion: None,
            period_bytes,
            mixes: 0,
        }
    }

    /// Route the producer through `gate`.
    ///
    /// Allocates the scratch buffer up front; the mix path never allocates.
    pub fn with_conversion(mut self, gate: Box<dyn ConversionGate>) -> Result<Self, OutputError> {
        let len = gate
            .scratch_len()
            .max(gate.source_len())
            .max(self.period_bytes);
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(len)
            .map_err(|err| OutputError::allocation("conversion scratch", len, err))?;
        scratch.resize(len, 0);
        self.conversion = Some(Conversion { gate, scratch });
        Ok(self)
    }

    pub fn conversion_needed(&self) -> bool {
        self.conversion.is_some()
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    /// Producer invocations so far.
    pub fn mix_count(&self) -> u64 {
        self.mixes
    }

    /// Fill `target` with one period.
    ///
    /// `target` must already be silent. When `paused` the producer is not
    /// called and the buffer stays silent. The ready marker is set whenever
    /// the buffer holds a finished period, paused or not. On a conversion
    /// length mismatch the target is left silent and unready.
    pub fn mix(&mut self, target: &mut PlaybackBuffer, paused: bool) -> Result<(), OutputError> {
        if paused {
            target.mark_ready();
            return Ok(());
        }

        let period = self.period_bytes;
        self.mixes += 1;

        match self.conversion.as_mut() {
            Some(conversion) => {
                let source_len = conversion.gate.source_len().min(conversion.scratch.len());
                (self.producer)(&mut conversion.scratch[..source_len]);
                let converted = conversion.gate.convert(&mut conversion.scratch);
                if converted != period || converted > conversion.scratch.len() {
                    return Err(OutputError::ConversionLengthMismatch {
                        expected: period,
                        actual: converted,
                    });
                }
                target.as_mut_slice()[..period].copy_from_slice(&conversion.scratch[..period]);
            }
            None => {
                (self.producer)(&mut target.as_mut_slice()[..period]);
            }
        }

        target.mark_ready();
        trace!("[MixEngine] mixed period #{} ({} bytes)", self.mixes, period);
        Ok(())
    }
}
