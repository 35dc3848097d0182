// CpalHost - real output through the platform audio API
//
// cpal pulls samples from a callback; there is no command queue. The host
// therefore only offers the double-buffer strategy: a play cursor walks the
// two buffers in the stream callback and, every time it runs off the end of
// one, clears its ready marker and notifies the handler with it.
//
// cpal::Stream is not Send, so each channel owns a thread that builds the
// stream, starts it on request and drops it on dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};

use super::{AudioHost, ChannelRequest, HostCapabilities, SoundChannel, SoundCommand};
use crate::audio::buffer_pool::{BufferIndex, BufferPair};
use crate::audio::callback::CompletionHandler;
use crate::error::OutputError;
use crate::format::{FormatDescriptor, SampleFormat};

/// Bytes converted per step when the stream wants 16-bit samples.
const CHUNK_BYTES: usize = 256;

/// Sound host backed by the default cpal output device.
#[derive(Debug, Clone, Default)]
pub struct CpalHost {
    device_name: Option<String>,
}

impl CpalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the output device with this name instead of the default one.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    /// Requested device name, or `None` for the system default.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl AudioHost for CpalHost {
    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            manager_major: 3,
            play_double_buffer: true,
            has_asc: false,
            callback_commands: false,
        }
    }

    fn new_channel(&self, request: ChannelRequest) -> Result<Box<dyn SoundChannel>, OutputError> {
        let disposed = Arc::new(AtomicBool::new(false));
        let cursor = PlayCursor {
            buffers: Arc::clone(&request.buffers),
            handler: Arc::clone(&request.handler),
            disposed: Arc::clone(&disposed),
            index: BufferIndex::First,
            offset: 0,
        };
        let descriptor = request.descriptor;
        let device_name = self.device_name.clone();

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), OutputError>>();
        let (control_tx, control_rx) = mpsc::channel::<Control>();

        let thread = thread::Builder::new()
            .name("dbuf-cpal-output".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), &descriptor, cursor) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(control) = control_rx.recv() {
                    match control {
                        Control::Play(reply) => {
                            let result = stream.play().map_err(|e| OutputError::CommandFailed {
                                reason: format!("Unable to play double buffered audio: {}", e),
                            });
                            let _ = reply.send(result);
                        }
                        Control::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .map_err(|e| OutputError::ChannelCreationFailure {
                reason: format!("Failed to spawn output thread: {}", e),
            })?;

        let built = ready_rx
            .recv()
            .unwrap_or_else(|_| {
                Err(OutputError::ChannelCreationFailure {
                    reason: "Output thread exited before building the stream".to_string(),
                })
            });
        if let Err(err) = built {
            let _ = thread.join();
            return Err(err);
        }

        info!(
            "[CpalHost] output stream ready: {} ch, {} Hz, {}",
            descriptor.channels, descriptor.sample_rate, descriptor.format
        );

        Ok(Box::new(CpalChannel {
            control: Mutex::new(Some(control_tx)),
            thread: Mutex::new(Some(thread)),
            disposed,
        }))
    }
}

enum Control {
    Play(mpsc::Sender<Result<(), OutputError>>),
    Shutdown,
}

struct CpalChannel {
    control: Mutex<Option<mpsc::Sender<Control>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

impl SoundChannel for CpalChannel {
    /// Blocks until the stream thread has started the stream.
    fn do_command(&self, command: SoundCommand) -> Result<(), OutputError> {
        match command {
            SoundCommand::PlayDoubleBuffer => {
                let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
                let sender = control.as_ref().ok_or_else(|| OutputError::CommandFailed {
                    reason: "channel disposed".to_string(),
                })?;
                let (reply_tx, reply_rx) = mpsc::channel();
                sender
                    .send(Control::Play(reply_tx))
                    .map_err(|_| OutputError::CommandFailed {
                        reason: "output thread is gone".to_string(),
                    })?;
                reply_rx.recv().unwrap_or_else(|_| {
                    Err(OutputError::CommandFailed {
                        reason: "output thread is gone".to_string(),
                    })
                })
            }
            other => Err(OutputError::CommandFailed {
                reason: format!("{:?} is not supported by the cpal host", other),
            }),
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Some(sender) = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(Control::Shutdown);
        }
        if let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if thread.join().is_err() {
                error!("[CpalHost] output thread panicked");
            }
        }
    }
}

/// Channel view handed to the handler from inside the stream callback.
struct StreamContext;

impl SoundChannel for StreamContext {
    fn do_command(&self, command: SoundCommand) -> Result<(), OutputError> {
        Err(OutputError::CommandFailed {
            reason: format!("{:?} cannot be issued from the stream callback", command),
        })
    }

    fn dispose(&self) {}
}

/// Position of the hardware inside the buffer pair.
struct PlayCursor {
    buffers: Arc<BufferPair>,
    handler: Arc<dyn CompletionHandler>,
    disposed: Arc<AtomicBool>,
    index: BufferIndex,
    offset: usize,
}

impl PlayCursor {
    /// Fill `out` with the next bytes of the buffer pair.
    ///
    /// A buffer that is not ready plays as silence. A busy buffer silences
    /// the rest of `out`.
    fn pull(&mut self, out: &mut [u8]) {
        let period = self.buffers.period_bytes();
        let mut written = 0;

        while written < out.len() {
            if self.disposed.load(Ordering::Acquire) {
                out[written..].fill(0);
                return;
            }

            let offset = self.offset;
            let target = &mut out[written..];
            let copied = self.buffers.try_with(self.index, |buffer| {
                let available = &buffer.as_slice()[offset..];
                let count = available.len().min(target.len());
                if buffer.is_ready() {
                    target[..count].copy_from_slice(&available[..count]);
                } else {
                    target[..count].fill(0);
                }
                count
            });

            let Some(count) = copied else {
                out[written..].fill(0);
                return;
            };
            written += count;
            self.offset += count;

            if self.offset >= period {
                let finished = self.index;
                self.buffers.try_with(finished, |buffer| buffer.clear_ready());
                self.index = finished.other();
                self.offset = 0;
                self.handler.on_complete(&StreamContext, finished);
            }
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    descriptor: &FormatDescriptor,
    mut cursor: PlayCursor,
) -> Result<cpal::Stream, OutputError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| OutputError::ChannelCreationFailure {
                reason: format!("Failed to enumerate output devices: {:?}", e),
            })?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false)),
        None => host.default_output_device(),
    }
    .ok_or_else(|| OutputError::ChannelCreationFailure {
        reason: "No output device found".to_string(),
    })?;

    let config = cpal::StreamConfig {
        channels: u16::from(descriptor.channels),
        sample_rate: cpal::SampleRate(descriptor.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| error!("[CpalHost] output stream error: {}", err);

    let stream = match descriptor.format {
        SampleFormat::U8 => device.build_output_stream(
            &config,
            move |data: &mut [u8], _: &cpal::OutputCallbackInfo| cursor.pull(data),
            err_fn,
            None,
        ),
        SampleFormat::S16Lsb | SampleFormat::S16Msb => {
            let big_endian = descriptor.format.is_big_endian();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut chunk = [0u8; CHUNK_BYTES];
                    for samples in data.chunks_mut(CHUNK_BYTES / 2) {
                        let bytes = &mut chunk[..samples.len() * 2];
                        cursor.pull(bytes);
                        for (sample, pair) in samples.iter_mut().zip(bytes.chunks_exact(2)) {
                            let pair = [pair[0], pair[1]];
                            *sample = if big_endian {
                                i16::from_be_bytes(pair)
                            } else {
                                i16::from_le_bytes(pair)
                            };
                        }
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(OutputError::UnsupportedFormat {
                reason: format!("{} is not a hardware format", other),
            })
        }
    }
    .map_err(|e| OutputError::ChannelCreationFailure {
        reason: format!("{:?}", e),
    })?;

    Ok(stream)
}
