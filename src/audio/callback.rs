//! Completion handlers - the notification side of the double-buffer protocol
//!
//! The host calls a [`CompletionHandler`] each time one of the two buffers
//! finishes playing. Two implementations exist:
//!
//! - [`ResubmitHandler`]: the host plays whatever buffer it is told to play.
//!   The handler submits the other (already mixed) buffer, refills the
//!   drained one and re-arms the callback.
//! - [`DoubleBufferHandler`]: the host's native primitive cycles both buffers
//!   itself and only asks for the drained buffer to be refilled and marked
//!   ready.
//!
//! # Real-Time Safety
//! `on_complete` runs in a context that may preempt application code:
//! - No blocking locks (only `try_lock` on the mixer and buffers)
//! - No allocation
//! - Bounded work apart from the producer callback itself
//!
//! # Cycle
//! ```text
//! host: buffer N drained
//!   └─> on_complete(N)
//!       ├─> enabled?            no → return
//!       ├─> submit 1-N          (resubmit variant only)
//!       ├─> silence N
//!       ├─> gate engaged?       yes → defer N (unlock mixes it)
//!       │                       no  → mix N
//!       └─> running?            yes → arm callback for 1-N (resubmit only)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::audio::buffer_pool::{BufferIndex, BufferPair, PlaybackBuffer};
use crate::audio::lock_gate::LockGate;
use crate::audio::mixer::MixEngine;
use crate::error::{log_output_error, OutputError};
use crate::format::FormatDescriptor;
use crate::hardware::{SoundChannel, SoundCommand};

/// Which completion protocol a channel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Driver-managed callback; one buffer resubmitted per notification.
    Resubmit,
    /// Native double-buffer primitive cycling both buffers.
    DoubleBuffer,
}

/// Flags owned by the device and read by the notification path.
#[derive(Debug)]
pub struct DeviceFlags {
    enabled: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
}

impl DeviceFlags {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

impl Default for DeviceFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    /// Notifications that ran the protocol.
    pub notifications: u64,
    /// Notifications dropped because the device was disabled.
    pub ignored: u64,
    /// Mixes performed in the notification context.
    pub handler_mixes: u64,
    /// Mixes performed outside the notification context (priming and unlock).
    pub deferred_mixes: u64,
    /// Notifications that recorded a deferral.
    pub deferrals: u64,
    /// Deferrals that replaced a still-owed deferral.
    pub overruns: u64,
    /// Times a buffer or the mixer was unexpectedly busy.
    pub contended: u64,
}

#[derive(Debug, Default)]
struct CycleCounters {
    notifications: AtomicU64,
    ignored: AtomicU64,
    handler_mixes: AtomicU64,
    deferred_mixes: AtomicU64,
    deferrals: AtomicU64,
    contended: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of a non-blocking mix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixAttempt {
    Mixed,
    /// Mixer or buffer held elsewhere; nothing was written.
    Busy,
    /// The mix failed and the device has been disabled.
    Failed,
}

/// State shared by the device, its handler and (for buffers) the host.
pub struct OutputState {
    descriptor: FormatDescriptor,
    buffers: Arc<BufferPair>,
    gate: LockGate,
    flags: DeviceFlags,
    mixer: Mutex<MixEngine>,
    fault: OnceCell<OutputError>,
    counters: CycleCounters,
}

impl OutputState {
    pub fn new(descriptor: FormatDescriptor, buffers: Arc<BufferPair>, mixer: MixEngine) -> Self {
        Self {
            descriptor,
            buffers,
            gate: LockGate::new(),
            flags: DeviceFlags::new(),
            mixer: Mutex::new(mixer),
            fault: OnceCell::new(),
            counters: CycleCounters::default(),
        }
    }

    pub fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    pub fn buffers(&self) -> &Arc<BufferPair> {
        &self.buffers
    }

    pub fn gate(&self) -> &LockGate {
        &self.gate
    }

    pub fn flags(&self) -> &DeviceFlags {
        &self.flags
    }

    /// First error raised while playing, if any.
    pub fn fault(&self) -> Option<OutputError> {
        self.fault.get().cloned()
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            handler_mixes: self.counters.handler_mixes.load(Ordering::Relaxed),
            deferred_mixes: self.counters.deferred_mixes.load(Ordering::Relaxed),
            deferrals: self.counters.deferrals.load(Ordering::Relaxed),
            overruns: self.gate.overruns(),
            contended: self.counters.contended.load(Ordering::Relaxed),
        }
    }

    /// Disable the device and park `err` for the application.
    ///
    /// Only the first fault is kept. Safe to call from the notification
    /// context.
    pub fn fail(&self, err: OutputError) {
        log_output_error(&err, "notification");
        self.flags.set_enabled(false);
        let _ = self.fault.set(err);
    }

    /// Mix `index` from the notification context without blocking.
    pub fn mix_in_notification(&self, index: BufferIndex) -> MixAttempt {
        let mut mixer = match self.mixer.try_lock() {
            Ok(mixer) => mixer,
            Err(TryLockError::WouldBlock) => {
                bump(&self.counters.contended);
                return MixAttempt::Busy;
            }
            Err(TryLockError::Poisoned(_)) => {
                self.fail(OutputError::LockPoisoned {
                    component: "mix engine".to_string(),
                });
                return MixAttempt::Failed;
            }
        };

        let paused = self.flags.is_paused();
        match self.buffers.try_with(index, |buffer| mixer.mix(buffer, paused)) {
            None => {
                bump(&self.counters.contended);
                MixAttempt::Busy
            }
            Some(Ok(())) => {
                bump(&self.counters.handler_mixes);
                MixAttempt::Mixed
            }
            Some(Err(err)) => {
                self.fail(err);
                MixAttempt::Failed
            }
        }
    }

    /// Silence and mix `index` from application context, waiting for the
    /// mixer and buffer if needed.
    ///
    /// Used by `unlock` to pay a deferral and by `start` to prime buffers.
    /// Does nothing once the device is disabled.
    pub fn mix_blocking(&self, index: BufferIndex) -> Result<(), OutputError> {
        if !self.flags.is_enabled() {
            return Ok(());
        }

        let mut mixer = match self.mixer.lock() {
            Ok(mixer) => mixer,
            Err(_) => {
                let err = OutputError::LockPoisoned {
                    component: "mix engine".to_string(),
                };
                self.fail(err.clone());
                return Err(err);
            }
        };

        let paused = self.flags.is_paused();
        let result = self.buffers.with(index, |buffer| {
            buffer.silence();
            mixer.mix(buffer, paused)
        });

        match result {
            Ok(()) => {
                bump(&self.counters.deferred_mixes);
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Silence `index` and either mix it or defer it, depending on the gate.
    ///
    /// The application only mixes while it holds the gate, so an open gate
    /// leaves the mixer to this context. If the buffer is still busy the
    /// period stays silent; it is never recorded as a deferral that no
    /// `unlock` would pay.
    fn refill(&self, index: BufferIndex, frames: u16) {
        let silenced = self
            .buffers
            .try_with(index, |buffer| {
                buffer.silence();
                buffer.set_frames(frames);
            })
            .is_some();
        if !silenced {
            bump(&self.counters.contended);
            warn!("[OutputState] drained buffer {:?} busy, cannot silence", index);
        }

        match self.gate.defer_if_engaged(index) {
            Some(deferral) => {
                bump(&self.counters.deferrals);
                if deferral.overran {
                    warn!(
                        "[OutputState] deferred mix overrun: buffer {:?} drained while a deferral was still owed",
                        index
                    );
                }
            }
            None => {
                if self.mix_in_notification(index) == MixAttempt::Busy {
                    debug!("[OutputState] mixer busy with the gate open, {:?} left silent", index);
                }
            }
        }
    }

    /// Guard shared by both handlers: drop the notification when disabled.
    fn admit(&self) -> bool {
        if self.flags.is_enabled() {
            bump(&self.counters.notifications);
            true
        } else {
            bump(&self.counters.ignored);
            false
        }
    }
}

/// Notification-side half of the protocol.
///
/// One implementation per [`Strategy`], chosen at open time.
pub trait CompletionHandler: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Prime the buffers and issue the commands that start the first cycle.
    ///
    /// Runs in application context before any notification can arrive.
    fn start(&self, channel: &dyn SoundChannel) -> Result<(), OutputError>;

    /// `drained` finished playing.
    fn on_complete(&self, channel: &dyn SoundChannel, drained: BufferIndex);

    /// Decode a raw host payload and dispatch it.
    ///
    /// Payloads other than 0 or 1 are logged and dropped.
    fn on_notification(&self, channel: &dyn SoundChannel, payload: u32) {
        match BufferIndex::from_payload(payload) {
            Some(index) => self.on_complete(channel, index),
            None => warn!(
                "[CompletionHandler] ignoring notification with payload {}",
                payload
            ),
        }
    }
}

/// Handler for hosts that play one submitted buffer at a time.
pub struct ResubmitHandler {
    state: Arc<OutputState>,
    prime: bool,
}

impl ResubmitHandler {
    pub fn new(state: Arc<OutputState>, prime: bool) -> Self {
        Self { state, prime }
    }
}

impl CompletionHandler for ResubmitHandler {
    fn strategy(&self) -> Strategy {
        Strategy::Resubmit
    }

    fn start(&self, channel: &dyn SoundChannel) -> Result<(), OutputError> {
        // The first notification drains buffer 0 and submits buffer 1.
        if self.prime {
            self.state.mix_blocking(BufferIndex::Second)?;
        }
        channel.do_command(SoundCommand::CallBack(BufferIndex::First))
    }

    fn on_complete(&self, channel: &dyn SoundChannel, drained: BufferIndex) {
        let state = &self.state;
        if !state.admit() {
            tracing::trace!(?drained, "device disabled, notification ignored");
            return;
        }

        let play = drained.other();
        if let Err(err) = channel.do_command(SoundCommand::Buffer(play)) {
            state.fail(err);
            return;
        }

        state.refill(drained, state.descriptor.frames);

        if state.flags.is_running() {
            if let Err(err) = channel.do_command(SoundCommand::CallBack(play)) {
                state.fail(err);
            }
        }
        tracing::trace!(?drained, ?play, "resubmit cycle complete");
    }
}

/// Handler for hosts with a native double-buffer primitive.
pub struct DoubleBufferHandler {
    state: Arc<OutputState>,
    prime: bool,
}

impl DoubleBufferHandler {
    pub fn new(state: Arc<OutputState>, prime: bool) -> Self {
        Self { state, prime }
    }
}

impl CompletionHandler for DoubleBufferHandler {
    fn strategy(&self) -> Strategy {
        Strategy::DoubleBuffer
    }

    fn start(&self, channel: &dyn SoundChannel) -> Result<(), OutputError> {
        let frames = self.state.descriptor.frames;
        for index in [BufferIndex::First, BufferIndex::Second] {
            if self.prime {
                self.state.mix_blocking(index)?;
            } else {
                self.state.buffers.with(index, PlaybackBuffer::mark_ready);
            }
            self.state.buffers.with(index, |buffer| buffer.set_frames(frames));
        }
        channel.do_command(SoundCommand::PlayDoubleBuffer)
    }

    fn on_complete(&self, _channel: &dyn SoundChannel, drained: BufferIndex) {
        let state = &self.state;
        if !state.admit() {
            tracing::trace!(?drained, "device disabled, refill ignored");
            return;
        }

        state.refill(drained, state.descriptor.frames);
        tracing::trace!(?drained, "double-buffer refill complete");
    }
}
