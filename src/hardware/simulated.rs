//! Deterministic in-process sound host.
//!
//! Plays nothing; instead every period the "hardware" would have played is
//! copied into a [`TapReader`](super::tap::TapReader) and every command and
//! notification is appended to an event log. Time only advances when the
//! caller says so ([`SimulatedHost::advance`]) or when a [`SimulatedClock`]
//! thread does it periodically.
//!
//! Supports both strategies:
//! - callback mode: `Buffer` starts playing a buffer, `CallBack` queues a
//!   notification that fires on the next `advance`
//! - double-buffer mode: after `PlayDoubleBuffer` each `advance` finishes the
//!   playing buffer, starts the other one and asks for a refill

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use super::tap::{PlaybackTap, PlayedPeriod, TapReader, TapWriter, DEFAULT_TAP_PERIODS};
use super::{AudioHost, ChannelRequest, HostCapabilities, SoundChannel, SoundCommand};
use crate::audio::buffer_pool::{BufferIndex, BufferPair};
use crate::audio::callback::CompletionHandler;
use crate::error::OutputError;
use crate::format::ChannelLayout;

/// Everything observable the simulated hardware did, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Created {
        layout: ChannelLayout,
        period_bytes: usize,
    },
    /// A buffer started playing.
    Submitted(BufferIndex),
    /// A callback was queued with this payload.
    Armed(BufferIndex),
    DoubleBufferStarted,
    /// The handler was invoked with this drained buffer.
    Notified(BufferIndex),
    /// A buffer started playing without being ready (or while busy).
    Underrun(BufferIndex),
    Disposed,
}

type EventLog = Arc<Mutex<Vec<ChannelEvent>>>;

fn push_event(log: &EventLog, event: ChannelEvent) {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Callback,
    DoubleBuffer,
}

struct SimState {
    mode: Mode,
    callbacks: VecDeque<BufferIndex>,
    playing: Option<BufferIndex>,
}

/// One open simulated channel.
struct SimChannel {
    handler: Arc<dyn CompletionHandler>,
    buffers: Arc<BufferPair>,
    capabilities: HostCapabilities,
    refuse_double_buffer: bool,
    queue_len: usize,
    state: Mutex<SimState>,
    tap: Mutex<TapWriter>,
    events: EventLog,
    /// Held for the whole of a notification; dispose waits on it.
    in_flight: Mutex<()>,
    disposed: AtomicBool,
}

impl SimChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `index` playing: copy it to the tap and log it.
    fn play(&self, index: BufferIndex, require_ready: bool) {
        push_event(&self.events, ChannelEvent::Submitted(index));
        let period = self.buffers.period_bytes();
        let mut underrun = false;
        self.tap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(index, |bytes| {
                let copied = self.buffers.try_with(index, |buffer| {
                    let ready = buffer.is_ready();
                    if !require_ready || ready {
                        bytes.extend_from_slice(buffer.as_slice());
                    }
                    buffer.clear_ready();
                    ready
                });
                underrun = match copied {
                    Some(ready) => require_ready && !ready,
                    None => true,
                };
                if underrun {
                    bytes.clear();
                    bytes.resize(period, 0);
                }
                underrun
            });
        if underrun {
            push_event(&self.events, ChannelEvent::Underrun(index));
        }
    }

    /// The playing buffer ran out. Returns false when nothing was pending.
    fn advance(&self) -> bool {
        let _flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }

        let (mode, drained) = {
            let mut state = self.state();
            match state.mode {
                Mode::Callback => (Mode::Callback, state.callbacks.pop_front()),
                Mode::DoubleBuffer => {
                    let finished = state.playing.unwrap_or(BufferIndex::First);
                    state.playing = Some(finished.other());
                    (Mode::DoubleBuffer, Some(finished))
                }
            }
        };
        let Some(drained) = drained else {
            return false;
        };

        if mode == Mode::DoubleBuffer {
            self.play(drained.other(), true);
        }
        push_event(&self.events, ChannelEvent::Notified(drained));
        self.handler.on_complete(self, drained);
        true
    }

    /// Deliver a raw notification payload, bypassing the command queue.
    fn inject(&self, payload: u32) {
        let _flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if let Some(index) = BufferIndex::from_payload(payload) {
            push_event(&self.events, ChannelEvent::Notified(index));
        }
        self.handler.on_notification(self, payload);
    }

    fn dropped(&self) -> u64 {
        self.tap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped()
    }
}

impl SoundChannel for SimChannel {
    fn do_command(&self, command: SoundCommand) -> Result<(), OutputError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(OutputError::CommandFailed {
                reason: "channel disposed".to_string(),
            });
        }

        match command {
            SoundCommand::Buffer(index) => {
                if !self.capabilities.supports_resubmit() {
                    return Err(OutputError::CommandFailed {
                        reason: "buffer commands not supported".to_string(),
                    });
                }
                self.state().playing = Some(index);
                self.play(index, false);
            }
            SoundCommand::CallBack(index) => {
                if !self.capabilities.supports_resubmit() {
                    return Err(OutputError::CommandFailed {
                        reason: "callback commands not supported".to_string(),
                    });
                }
                let mut state = self.state();
                if state.callbacks.len() >= self.queue_len {
                    return Err(OutputError::CommandFailed {
                        reason: format!("command queue full ({} entries)", self.queue_len),
                    });
                }
                state.callbacks.push_back(index);
                drop(state);
                push_event(&self.events, ChannelEvent::Armed(index));
            }
            SoundCommand::PlayDoubleBuffer => {
                if self.refuse_double_buffer || !self.capabilities.supports_double_buffer() {
                    return Err(OutputError::CommandFailed {
                        reason: "Unable to play double buffered audio".to_string(),
                    });
                }
                {
                    let mut state = self.state();
                    state.mode = Mode::DoubleBuffer;
                    state.playing = Some(BufferIndex::First);
                }
                push_event(&self.events, ChannelEvent::DoubleBufferStarted);
                self.play(BufferIndex::First, true);
            }
        }
        Ok(())
    }

    fn dispose(&self) {
        let _flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.state().callbacks.clear();
            push_event(&self.events, ChannelEvent::Disposed);
            debug!("[SimulatedHost] channel disposed");
        }
    }
}

/// Owning handle given to the device. Dropping it frees the channel.
struct SimulatedChannel(Arc<SimChannel>);

impl SoundChannel for SimulatedChannel {
    fn do_command(&self, command: SoundCommand) -> Result<(), OutputError> {
        self.0.do_command(command)
    }

    fn dispose(&self) {
        self.0.dispose()
    }
}

struct HostShared {
    capabilities: HostCapabilities,
    tap_periods: usize,
    refuse_channels: AtomicBool,
    refuse_double_buffer: AtomicBool,
    channel: Mutex<Weak<SimChannel>>,
    buffers: Mutex<Weak<BufferPair>>,
    reader: Mutex<Option<TapReader>>,
    events: EventLog,
}

/// Simulated sound manager.
///
/// Cheap to clone; clones share the same channel and logs.
#[derive(Clone)]
pub struct SimulatedHost {
    shared: Arc<HostShared>,
}

impl SimulatedHost {
    /// Host with every capability present.
    pub fn new() -> Self {
        Self::with_capabilities(HostCapabilities {
            manager_major: 3,
            play_double_buffer: true,
            has_asc: false,
            callback_commands: true,
        })
    }

    pub fn with_capabilities(capabilities: HostCapabilities) -> Self {
        Self::with_tap(capabilities, DEFAULT_TAP_PERIODS)
    }

    pub fn with_tap(capabilities: HostCapabilities, tap_periods: usize) -> Self {
        Self {
            shared: Arc::new(HostShared {
                capabilities,
                tap_periods: tap_periods.max(1),
                refuse_channels: AtomicBool::new(false),
                refuse_double_buffer: AtomicBool::new(false),
                channel: Mutex::new(Weak::new()),
                buffers: Mutex::new(Weak::new()),
                reader: Mutex::new(None),
                events: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Make the next `new_channel` calls fail.
    pub fn refuse_channels(&self, refuse: bool) {
        self.shared.refuse_channels.store(refuse, Ordering::Release);
    }

    /// Make `PlayDoubleBuffer` fail on channels created from now on.
    pub fn refuse_double_buffer(&self, refuse: bool) {
        self.shared
            .refuse_double_buffer
            .store(refuse, Ordering::Release);
    }

    fn active(&self) -> Option<Arc<SimChannel>> {
        self.shared
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Finish the playing buffer and deliver the resulting notification.
    ///
    /// Returns false when no channel is open or nothing is armed.
    pub fn advance(&self) -> bool {
        self.active().map(|channel| channel.advance()).unwrap_or(false)
    }

    /// Run `cycles` notifications. Returns how many were delivered.
    pub fn run(&self, cycles: usize) -> usize {
        (0..cycles).take_while(|_| self.advance()).count()
    }

    /// Deliver a notification with an arbitrary payload.
    pub fn inject(&self, payload: u32) {
        if let Some(channel) = self.active() {
            channel.inject(payload);
        }
    }

    /// Drain the periods played since the last call.
    pub fn played(&self) -> Vec<PlayedPeriod> {
        self.shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(TapReader::drain)
            .unwrap_or_default()
    }

    /// Periods the tap could not keep.
    pub fn dropped_periods(&self) -> u64 {
        self.active().map(|channel| channel.dropped()).unwrap_or(0)
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_events(&self) {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// True once the buffer pair of the last channel has been freed.
    pub fn buffers_released(&self) -> bool {
        self.shared
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .is_none()
    }

    /// Drive `advance` from a background thread every `period`.
    pub fn spawn_clock(&self, period: Duration) -> SimulatedClock {
        let host = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicU64::new(0));
        let thread_stop = Arc::clone(&stop);
        let thread_cycles = Arc::clone(&cycles);

        let handle = thread::Builder::new()
            .name("dbuf-sim-clock".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    if host.advance() {
                        thread_cycles.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(period);
                }
            })
            .ok();

        SimulatedClock {
            stop,
            cycles,
            handle,
        }
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for SimulatedHost {
    fn capabilities(&self) -> HostCapabilities {
        self.shared.capabilities
    }

    fn new_channel(&self, request: ChannelRequest) -> Result<Box<dyn SoundChannel>, OutputError> {
        if self.shared.refuse_channels.load(Ordering::Acquire) {
            return Err(OutputError::ChannelCreationFailure {
                reason: "simulated host refused the channel".to_string(),
            });
        }
        if request.queue_len == 0 {
            return Err(OutputError::ChannelCreationFailure {
                reason: "command queue length must be at least 1".to_string(),
            });
        }

        let period_bytes = request.descriptor.period_bytes;
        let (writer, reader) = PlaybackTap::new(self.shared.tap_periods, period_bytes).split();

        let channel = Arc::new(SimChannel {
            handler: request.handler,
            buffers: Arc::clone(&request.buffers),
            capabilities: self.shared.capabilities,
            refuse_double_buffer: self.shared.refuse_double_buffer.load(Ordering::Acquire),
            queue_len: request.queue_len,
            state: Mutex::new(SimState {
                mode: Mode::Callback,
                callbacks: VecDeque::with_capacity(request.queue_len),
                playing: None,
            }),
            tap: Mutex::new(writer),
            events: Arc::clone(&self.shared.events),
            in_flight: Mutex::new(()),
            disposed: AtomicBool::new(false),
        });

        *self
            .shared
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&channel);
        *self
            .shared
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&request.buffers);
        *self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader);

        push_event(
            &self.shared.events,
            ChannelEvent::Created {
                layout: request.layout,
                period_bytes,
            },
        );
        info!(
            "[SimulatedHost] channel created: {:?}, {} bytes per period, queue {}",
            request.layout, period_bytes, request.queue_len
        );

        Ok(Box::new(SimulatedChannel(channel)))
    }
}

/// Background thread advancing a [`SimulatedHost`].
pub struct SimulatedClock {
    stop: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedClock {
    /// Notifications delivered so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Stop the thread and return the number of delivered notifications.
    pub fn stop(mut self) -> u64 {
        self.halt();
        self.cycles()
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedClock {
    fn drop(&mut self) {
        self.halt();
    }
}
