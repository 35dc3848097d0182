// BufferPair - the two period buffers shared by the mixer and the hardware
//
// Exactly two buffers exist for the life of an open channel. At any moment one
// of them belongs to the hardware (playing) and the other to the mixer
// (fillable). Ownership flips on every completion notification.
//
// Each buffer sits behind its own mutex so the Rust type system can hand the
// bytes across threads, but the protocol guarantees the two parties never
// want the same buffer at once. The notification context therefore only ever
// uses `try_with`, which never blocks; a failed try means the protocol was
// violated and the caller degrades to silence or deferral instead of waiting.

use std::sync::{Mutex, MutexGuard, TryLockError};

use log::warn;

use crate::error::OutputError;

/// Index of one of the two playback buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferIndex {
    First,
    Second,
}

impl BufferIndex {
    /// The buffer that is not `self`.
    pub fn other(self) -> BufferIndex {
        match self {
            BufferIndex::First => BufferIndex::Second,
            BufferIndex::Second => BufferIndex::First,
        }
    }

    pub fn as_usize(self) -> usize {
        match self {
            BufferIndex::First => 0,
            BufferIndex::Second => 1,
        }
    }

    /// Decode a raw notification payload. Anything but 0 or 1 is rejected.
    pub fn from_payload(payload: u32) -> Option<BufferIndex> {
        match payload {
            0 => Some(BufferIndex::First),
            1 => Some(BufferIndex::Second),
            _ => None,
        }
    }
}

/// One period of hardware-layout sample bytes.
#[derive(Debug)]
pub struct PlaybackBuffer {
    data: Vec<u8>,
    /// Frames the hardware should play from this buffer.
    frames: u16,
    /// Set once the buffer holds a finished period.
    ready: bool,
}

impl PlaybackBuffer {
    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// Uses a fallible reservation so an impossible size surfaces as
    /// [`OutputError::AllocationFailure`] instead of aborting.
    pub fn allocate(len: usize, frames: u16) -> Result<Self, OutputError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|err| OutputError::allocation("playback buffer", len, err))?;
        data.resize(len, 0);
        Ok(Self {
            data,
            frames,
            ready: false,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the bytes and drop the ready marker.
    pub fn silence(&mut self) {
        self.data.fill(0);
        self.ready = false;
    }

    pub fn frames(&self) -> u16 {
        self.frames
    }

    pub fn set_frames(&mut self, frames: u16) {
        self.frames = frames;
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// The two buffers of an open channel.
pub struct BufferPair {
    buffers: [Mutex<PlaybackBuffer>; 2],
    period_bytes: usize,
}

impl BufferPair {
    /// Allocate both buffers, zeroed, each `period_bytes` long.
    ///
    /// If the second allocation fails the first is released before the error
    /// is returned.
    pub fn allocate(period_bytes: usize, frames: u16) -> Result<Self, OutputError> {
        let first = PlaybackBuffer::allocate(period_bytes, frames)?;
        let second = PlaybackBuffer::allocate(period_bytes, frames)?;
        Ok(Self {
            buffers: [Mutex::new(first), Mutex::new(second)],
            period_bytes,
        })
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    /// Run `f` on the buffer if nobody else holds it. Never blocks.
    ///
    /// A poisoned buffer is still plain bytes, so the guard is recovered.
    pub fn try_with<R>(
        &self,
        index: BufferIndex,
        f: impl FnOnce(&mut PlaybackBuffer) -> R,
    ) -> Option<R> {
        let mut guard = match self.buffers[index.as_usize()].try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("[BufferPair] buffer {:?} poisoned, recovering", index);
                poisoned.into_inner()
            }
        };
        Some(f(&mut guard))
    }

    /// Run `f` on the buffer, waiting for it if necessary.
    ///
    /// Application context only; the notification path uses [`Self::try_with`].
    pub fn with<R>(&self, index: BufferIndex, f: impl FnOnce(&mut PlaybackBuffer) -> R) -> R {
        let mut guard: MutexGuard<'_, PlaybackBuffer> = self.buffers[index.as_usize()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Copy the buffer's bytes into `out` without blocking.
    ///
    /// Returns the ready marker as it was, or `None` if the buffer was busy.
    pub fn try_copy_into(&self, index: BufferIndex, out: &mut Vec<u8>) -> Option<bool> {
        self.try_with(index, |buffer| {
            out.clear();
            out.extend_from_slice(buffer.as_slice());
            buffer.is_ready()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_index_other() {
        assert_eq!(BufferIndex::First.other(), BufferIndex::Second);
        assert_eq!(BufferIndex::Second.other(), BufferIndex::First);
        assert_eq!(BufferIndex::First.other().other(), BufferIndex::First);
    }

    #[test]
    fn test_buffer_index_from_payload() {
        assert_eq!(BufferIndex::from_payload(0), Some(BufferIndex::First));
        assert_eq!(BufferIndex::from_payload(1), Some(BufferIndex::Second));
        assert_eq!(BufferIndex::from_payload(2), None);
        assert_eq!(BufferIndex::from_payload(0xd), None);
    }

    #[test]
    fn test_pair_allocation() {
        let pair = BufferPair::allocate(176, 44).unwrap();
        assert_eq!(pair.period_bytes(), 176);

        for index in [BufferIndex::First, BufferIndex::Second] {
            pair.with(index, |buffer| {
                assert_eq!(buffer.len(), 176, "Buffer should have period size");
                assert!(
                    buffer.as_slice().iter().all(|&b| b == 0),
                    "Fresh buffers should be silent"
                );
                assert_eq!(buffer.frames(), 44);
                assert!(!buffer.is_ready());
            });
        }
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let result = PlaybackBuffer::allocate(usize::MAX, 1);
        assert!(matches!(
            result,
            Err(OutputError::AllocationFailure { bytes, .. }) if bytes == usize::MAX
        ));

        let result = BufferPair::allocate(usize::MAX, 1);
        assert!(result.is_err(), "Pair allocation should fail cleanly");
    }

    #[test]
    fn test_silence_clears_data_and_ready() {
        let mut buffer = PlaybackBuffer::allocate(8, 2).unwrap();
        buffer.as_mut_slice().fill(0x7F);
        buffer.mark_ready();
        assert!(buffer.is_ready());

        buffer.silence();
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
        assert!(!buffer.is_ready());
        assert_eq!(buffer.len(), 8, "Silence must not resize the buffer");
    }

    #[test]
    fn test_try_with_does_not_block_on_held_buffer() {
        let pair = BufferPair::allocate(4, 1).unwrap();
        pair.with(BufferIndex::First, |_held| {
            assert!(
                pair.try_with(BufferIndex::First, |_| ()).is_none(),
                "Held buffer should report busy"
            );
            assert!(
                pair.try_with(BufferIndex::Second, |_| ()).is_some(),
                "Other buffer should stay available"
            );
        });
    }

    #[test]
    fn test_try_copy_into() {
        let pair = BufferPair::allocate(4, 1).unwrap();
        pair.with(BufferIndex::Second, |buffer| {
            buffer.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
            buffer.mark_ready();
        });

        let mut out = vec![9; 16];
        let ready = pair.try_copy_into(BufferIndex::Second, &mut out);
        assert_eq!(ready, Some(true));
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BufferPair>();
    }
}
