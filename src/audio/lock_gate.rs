//! Lock gate - engagement counter and deferred-mix bookkeeping
//!
//! Application code engages the gate to stop the notification path from
//! running the producer callback. The hardware keeps cycling while engaged;
//! a notification that finds the gate engaged records the buffer it could not
//! mix and leaves the mix to whichever `unlock` fully disengages the gate.
//!
//! Depth, the pending flag and the fill index share one atomic word, so a
//! deferral and the final release can never interleave: the releasing
//! `unlock` either sees the deferral or the notification sees the gate open.
//! The releasing `unlock` pays owed mixes while still holding depth 1, which
//! keeps the notification side off the mixer for the whole payment.
//!
//! # Word layout
//! ```text
//!  63        34   33          32        31 ........ 0
//! [  unused   ][fill index][pending][  engagement depth  ]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::audio::buffer_pool::BufferIndex;
use crate::error::OutputError;

/// At most one deferred mix can be owed: one buffer is always playing, so
/// only the other can be drained-but-unmixed.
pub const MAX_DEFERRED_MIXES: u32 = 1;

const DEPTH_MASK: u64 = 0xFFFF_FFFF;
const PENDING_BIT: u64 = 1 << 32;
const FILL_BIT: u64 = 1 << 33;

/// Result of releasing one level of engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disengaged {
    /// Other lock() calls are still outstanding.
    StillEngaged { depth: u32 },
    /// This was the last engagement but a mix is owed. The gate stays at
    /// depth 1 with the deferral claimed by the caller, who must mix `index`
    /// and call [`LockGate::disengage`] again.
    Owed { index: BufferIndex },
    /// The gate is open again and nothing is owed.
    Released,
}

/// Outcome of recording a skipped mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    /// True when an earlier deferral was still owed and got replaced.
    pub overran: bool,
}

/// Engagement counter, pending-mix flag and the fill-index slot.
#[derive(Debug)]
pub struct LockGate {
    word: AtomicU64,
    overruns: AtomicU64,
}

fn depth_of(word: u64) -> u32 {
    (word & DEPTH_MASK) as u32
}

fn index_of(word: u64) -> BufferIndex {
    if word & FILL_BIT == 0 {
        BufferIndex::First
    } else {
        BufferIndex::Second
    }
}

impl LockGate {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    /// Increment the engagement counter. Returns the new depth.
    pub fn engage(&self) -> u32 {
        depth_of(self.word.fetch_add(1, Ordering::AcqRel)) + 1
    }

    /// Release one level of engagement.
    ///
    /// At depth 1 with a deferral pending, the deferral is handed to the
    /// caller as [`Disengaged::Owed`] and the depth is kept. The gate only
    /// opens on a call that finds nothing owed, so the pending flag is clear
    /// whenever this returns `Released`. Unlocking an unengaged gate leaves
    /// the counter at zero and reports [`OutputError::UnbalancedUnlock`].
    pub fn disengage(&self) -> Result<Disengaged, OutputError> {
        let previous = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                match depth_of(word) {
                    0 => None,
                    1 if word & PENDING_BIT != 0 => Some(word & !PENDING_BIT),
                    _ => Some(word - 1),
                }
            })
            .map_err(|_| OutputError::UnbalancedUnlock)?;

        Ok(match depth_of(previous) {
            1 if previous & PENDING_BIT != 0 => Disengaged::Owed {
                index: index_of(previous),
            },
            1 => Disengaged::Released,
            depth => Disengaged::StillEngaged { depth: depth - 1 },
        })
    }

    pub fn is_engaged(&self) -> bool {
        self.depth() > 0
    }

    pub fn depth(&self) -> u32 {
        depth_of(self.word.load(Ordering::Acquire))
    }

    /// Deferred mixes currently owed (0 or 1).
    pub fn pending(&self) -> u32 {
        u32::from(self.word.load(Ordering::Acquire) & PENDING_BIT != 0)
    }

    /// Record that `index` was drained but cannot be mixed, if the gate is
    /// engaged. Returns `None` when the gate is open; the caller mixes.
    ///
    /// The pending flag saturates at [`MAX_DEFERRED_MIXES`]. A second
    /// deferral before the first is paid retargets the slot at the newest
    /// drained buffer and counts an overrun.
    pub fn defer_if_engaged(&self, index: BufferIndex) -> Option<Deferral> {
        let fill = match index {
            BufferIndex::First => 0,
            BufferIndex::Second => FILL_BIT,
        };
        let previous = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (depth_of(word) > 0).then_some((word & !FILL_BIT) | fill | PENDING_BIT)
            })
            .ok()?;

        let overran = previous & PENDING_BIT != 0;
        if overran {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        Some(Deferral { overran })
    }

    /// Buffer most recently recorded by [`Self::defer_if_engaged`].
    pub fn fill_index(&self) -> BufferIndex {
        index_of(self.word.load(Ordering::Acquire))
    }

    /// Deferrals that replaced a still-owed deferral.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for LockGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_engage_and_release() {
        let gate = LockGate::new();
        assert!(!gate.is_engaged());

        assert_eq!(gate.engage(), 1);
        assert!(gate.is_engaged());

        assert_eq!(gate.disengage(), Ok(Disengaged::Released));
        assert!(!gate.is_engaged());
    }

    #[test]
    fn test_open_gate_refuses_deferral() {
        let gate = LockGate::new();
        assert_eq!(gate.defer_if_engaged(BufferIndex::First), None);
        assert_eq!(gate.pending(), 0);
    }

    #[test]
    fn test_nested_engagement() {
        let gate = LockGate::new();
        gate.engage();
        gate.engage();
        assert_eq!(gate.depth(), 2);

        assert!(gate.defer_if_engaged(BufferIndex::Second).is_some());
        assert_eq!(
            gate.disengage(),
            Ok(Disengaged::StillEngaged { depth: 1 }),
            "Inner unlock must not drain the deferral"
        );
        assert_eq!(gate.pending(), 1);

        assert_eq!(
            gate.disengage(),
            Ok(Disengaged::Owed {
                index: BufferIndex::Second
            })
        );
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.depth(), 1, "Depth is held while the mix is paid");

        assert_eq!(gate.disengage(), Ok(Disengaged::Released));
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    fn test_unbalanced_unlock() {
        let gate = LockGate::new();
        assert_eq!(gate.disengage(), Err(OutputError::UnbalancedUnlock));
        assert_eq!(gate.depth(), 0, "Counter must never go below zero");
    }

    #[test]
    fn test_deferral_carries_fill_index() {
        let gate = LockGate::new();
        gate.engage();

        let deferral = gate.defer_if_engaged(BufferIndex::First).unwrap();
        assert!(!deferral.overran);
        assert_eq!(gate.fill_index(), BufferIndex::First);
        assert_eq!(gate.depth(), 1, "Deferral leaves the depth alone");

        assert_eq!(
            gate.disengage(),
            Ok(Disengaged::Owed {
                index: BufferIndex::First
            })
        );
    }

    #[test]
    fn test_deferral_saturates_at_one() {
        let gate = LockGate::new();
        gate.engage();

        gate.defer_if_engaged(BufferIndex::First);
        let second = gate.defer_if_engaged(BufferIndex::Second).unwrap();
        assert!(second.overran);
        assert_eq!(gate.pending(), MAX_DEFERRED_MIXES);
        assert_eq!(gate.overruns(), 1);
        assert_eq!(
            gate.fill_index(),
            BufferIndex::Second,
            "Newest drained buffer should be the fill target"
        );

        assert_eq!(
            gate.disengage(),
            Ok(Disengaged::Owed {
                index: BufferIndex::Second
            })
        );
        assert_eq!(gate.disengage(), Ok(Disengaged::Released));
    }

    #[test]
    fn test_deferral_during_payment_is_owed_again() {
        let gate = LockGate::new();
        gate.engage();
        gate.defer_if_engaged(BufferIndex::First);
        assert!(matches!(gate.disengage(), Ok(Disengaged::Owed { .. })));

        // A notification lands while the first mix is being paid.
        assert!(gate.defer_if_engaged(BufferIndex::Second).is_some());
        assert_eq!(
            gate.disengage(),
            Ok(Disengaged::Owed {
                index: BufferIndex::Second
            })
        );
        assert_eq!(gate.disengage(), Ok(Disengaged::Released));
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.overruns(), 0);
    }

    #[test]
    fn test_concurrent_defer_and_release_never_strand() {
        for _ in 0..500 {
            let gate = Arc::new(LockGate::new());
            gate.engage();

            let notifier = {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.defer_if_engaged(BufferIndex::First).is_some())
            };

            let mut paid = 0;
            loop {
                match gate.disengage().unwrap() {
                    Disengaged::Owed { .. } => paid += 1,
                    Disengaged::Released => break,
                    Disengaged::StillEngaged { .. } => unreachable!(),
                }
            }
            let deferred = notifier.join().unwrap();

            assert_eq!(gate.pending(), 0, "Released gate must owe nothing");
            assert_eq!(
                paid,
                usize::from(deferred),
                "A deferral is paid exactly when the notification saw the gate engaged"
            );
        }
    }
}
