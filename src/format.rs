//! Sample formats and the per-channel format descriptor
//!
//! The output hardware plays unsigned 8-bit and signed 16-bit samples only.
//! Requests for the two other legacy formats are coerced here, which is the
//! only place the crate decides that a conversion is needed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OutputError;

/// Sample encodings accepted by [`FormatRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    U8,
    S8,
    U16Lsb,
    S16Lsb,
    U16Msb,
    S16Msb,
}

impl SampleFormat {
    /// Legacy numeric identifier (bit width in the low byte, 0x8000 = signed,
    /// 0x1000 = big endian).
    pub fn code(self) -> u16 {
        match self {
            SampleFormat::U8 => 0x0008,
            SampleFormat::S8 => 0x8008,
            SampleFormat::U16Lsb => 0x0010,
            SampleFormat::S16Lsb => 0x8010,
            SampleFormat::U16Msb => 0x1010,
            SampleFormat::S16Msb => 0x9010,
        }
    }

    pub fn bits(self) -> u16 {
        self.code() & 0x00FF
    }

    pub fn bytes_per_sample(self) -> usize {
        usize::from(self.bits() / 8)
    }

    pub fn is_signed(self) -> bool {
        self.code() & 0x8000 != 0
    }

    pub fn is_big_endian(self) -> bool {
        self.code() & 0x1000 != 0
    }

    /// Apply the fixed coercion table.
    ///
    /// S8 plays as U8 and unsigned 16-bit plays as signed 16-bit of the same
    /// byte order. Every other format passes through unchanged.
    pub fn coerce(self) -> SampleFormat {
        match self {
            SampleFormat::S8 => SampleFormat::U8,
            SampleFormat::U16Lsb => SampleFormat::S16Lsb,
            SampleFormat::U16Msb => SampleFormat::S16Msb,
            other => other,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S8 => "s8",
            SampleFormat::U16Lsb => "u16lsb",
            SampleFormat::S16Lsb => "s16lsb",
            SampleFormat::U16Msb => "u16msb",
            SampleFormat::S16Msb => "s16msb",
        };
        f.write_str(name)
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" => Ok(SampleFormat::U8),
            "s8" => Ok(SampleFormat::S8),
            "u16lsb" | "u16le" => Ok(SampleFormat::U16Lsb),
            "s16lsb" | "s16le" => Ok(SampleFormat::S16Lsb),
            "u16msb" | "u16be" => Ok(SampleFormat::U16Msb),
            "s16msb" | "s16be" => Ok(SampleFormat::S16Msb),
            other => Err(format!("unknown sample format '{}'", other)),
        }
    }
}

/// Channel initialisation mode handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

/// Compression identifier carried in the buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Plain PCM in the hardware's native layout.
    None,
    /// Fixed compression with the 16-bit little-endian converter installed.
    Fixed16BitLittleEndian,
}

/// What the application asks `open` for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub format: SampleFormat,
    pub channels: u8,
    pub sample_rate: u32,
    /// Frames per period (one buffer).
    pub frames: u16,
}

impl FormatRequest {
    pub fn new(format: SampleFormat, channels: u8, sample_rate: u32, frames: u16) -> Self {
        Self {
            format,
            channels,
            sample_rate,
            frames,
        }
    }
}

/// Negotiated format of an open channel.
///
/// Computed once by [`FormatDescriptor::negotiate`] and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Format the producer writes.
    pub requested: SampleFormat,
    /// Format the hardware plays.
    pub format: SampleFormat,
    pub channels: u8,
    pub sample_bits: u16,
    pub sample_rate: u32,
    pub frames: u16,
    pub compression: Compression,
    pub period_bytes: usize,
}

impl FormatDescriptor {
    /// Coerce the request onto a hardware format and size one period.
    pub fn negotiate(request: &FormatRequest) -> Result<Self, OutputError> {
        if request.channels == 0 {
            return Err(OutputError::UnsupportedFormat {
                reason: "channel count must be at least 1".to_string(),
            });
        }
        if request.frames == 0 {
            return Err(OutputError::UnsupportedFormat {
                reason: "period must hold at least one frame".to_string(),
            });
        }
        if request.sample_rate == 0 {
            return Err(OutputError::UnsupportedFormat {
                reason: "sample rate must be greater than 0".to_string(),
            });
        }

        let format = request.format.coerce();
        let period_bytes = usize::from(request.channels)
            .checked_mul(format.bytes_per_sample())
            .and_then(|frame| frame.checked_mul(usize::from(request.frames)))
            .ok_or_else(|| OutputError::UnsupportedFormat {
                reason: "period size overflows".to_string(),
            })?;

        let sample_bits =
            (period_bytes / usize::from(request.frames) / usize::from(request.channels) * 8) as u16;

        let compression = if format == SampleFormat::S16Lsb {
            Compression::Fixed16BitLittleEndian
        } else {
            Compression::None
        };

        Ok(Self {
            requested: request.format,
            format,
            channels: request.channels,
            sample_bits,
            sample_rate: request.sample_rate,
            frames: request.frames,
            compression,
            period_bytes,
        })
    }

    /// True when the producer's encoding differs from the hardware's.
    pub fn conversion_needed(&self) -> bool {
        self.requested != self.format
    }

    pub fn layout(&self) -> ChannelLayout {
        if self.channels >= 2 {
            ChannelLayout::Stereo
        } else {
            ChannelLayout::Mono
        }
    }

    /// Sample rate as 16.16 fixed point, the way buffer headers carry it.
    pub fn sample_rate_fixed(&self) -> u64 {
        u64::from(self.sample_rate) << 16
    }

    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * self.format.bytes_per_sample()
    }
}
