use super::*;
use crate::audio::buffer_pool::BufferIndex;
use crate::format::SampleFormat;
use crate::hardware::{ChannelEvent, HostCapabilities, SimulatedHost};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

fn stereo_16() -> FormatRequest {
    FormatRequest::new(SampleFormat::S16Lsb, 2, 22050, 44)
}

fn constant(byte: u8) -> ProducerCallback {
    Box::new(move |buffer: &mut [u8]| buffer.fill(byte))
}

fn resubmit_only() -> HostCapabilities {
    HostCapabilities {
        manager_major: 2,
        play_double_buffer: false,
        has_asc: false,
        callback_commands: true,
    }
}

fn no_features() -> HostCapabilities {
    HostCapabilities {
        manager_major: 3,
        play_double_buffer: false,
        has_asc: false,
        callback_commands: false,
    }
}

#[test]
fn test_open_reports_period_bytes() {
    let host = SimulatedHost::new();
    let device = OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default())
        .unwrap();

    assert!(device.is_open());
    assert_eq!(device.period_bytes(), 176);
    assert_eq!(device.descriptor().sample_bits, 16);
    assert_eq!(device.strategy(), Strategy::DoubleBuffer);
}

#[test]
fn test_auto_falls_back_to_resubmit() {
    let host = SimulatedHost::with_capabilities(resubmit_only());
    let device = OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default())
        .unwrap();
    assert_eq!(device.strategy(), Strategy::Resubmit);
}

#[test]
fn test_capability_checked_before_allocation() {
    let host = SimulatedHost::with_capabilities(no_features());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let producer: ProducerCallback = Box::new(move |_: &mut [u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = OutputDevice::open(&host, stereo_16(), producer, &OutputConfig::default());

    assert!(matches!(
        result,
        Err(OutputError::CapabilityUnavailable { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(
        host.events().is_empty(),
        "No channel may be requested when the capability is missing"
    );
}

#[test]
fn test_explicit_double_buffer_without_capability() {
    let host = SimulatedHost::with_capabilities(resubmit_only());
    let config = OutputConfig {
        strategy: StrategyPreference::DoubleBuffer,
        ..OutputConfig::default()
    };
    match OutputDevice::open(&host, stereo_16(), constant(0), &config) {
        Err(OutputError::CapabilityUnavailable { feature }) => {
            assert_eq!(feature, "native double buffering");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("open must fail"),
    }
}

#[test]
fn test_unsupported_format_rejected() {
    let host = SimulatedHost::new();
    let request = FormatRequest::new(SampleFormat::U8, 0, 22050, 44);
    let result = OutputDevice::open(&host, request, constant(0), &OutputConfig::default());
    assert!(matches!(result, Err(OutputError::UnsupportedFormat { .. })));
}

#[test]
fn test_channel_refusal_releases_buffers() {
    let host = SimulatedHost::new();
    host.refuse_channels(true);

    let result = OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default());

    assert!(matches!(
        result,
        Err(OutputError::ChannelCreationFailure { .. })
    ));
    assert!(host.buffers_released());
}

#[test]
fn test_zero_queue_length_refused() {
    let host = SimulatedHost::new();
    let config = OutputConfig {
        command_queue_len: 0,
        ..OutputConfig::default()
    };
    let result = OutputDevice::open(&host, stereo_16(), constant(0), &config);
    assert!(matches!(
        result,
        Err(OutputError::ChannelCreationFailure { .. })
    ));
}

#[test]
fn test_double_buffer_start_failure_disposes_channel() {
    let host = SimulatedHost::new();
    host.refuse_double_buffer(true);

    let result = OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default());

    assert!(matches!(result, Err(OutputError::CommandFailed { .. })));
    assert!(host.events().contains(&ChannelEvent::Disposed));
    assert!(host.buffers_released());
}

#[test]
fn test_close_is_idempotent() {
    let host = SimulatedHost::new();
    let mut device =
        OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default()).unwrap();

    assert!(device.close().is_ok());
    assert!(device.close().is_ok());
    assert!(!device.is_open());
    assert!(host.buffers_released());
}

#[test]
fn test_lock_after_close_is_not_open() {
    let host = SimulatedHost::new();
    let mut device =
        OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default()).unwrap();
    device.close().unwrap();

    assert_eq!(device.lock(), Err(OutputError::NotOpen));
    assert_eq!(device.unlock(), Err(OutputError::NotOpen));
}

#[test]
fn test_unbalanced_unlock() {
    let host = SimulatedHost::new();
    let device =
        OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default()).unwrap();

    assert_eq!(device.unlock(), Err(OutputError::UnbalancedUnlock));
    assert_eq!(device.lock_depth(), 0);
}

#[test]
fn test_nested_lock_defers_until_outermost_unlock() {
    let host = SimulatedHost::with_capabilities(resubmit_only());
    let device =
        OutputDevice::open(&host, stereo_16(), constant(0x11), &OutputConfig::default()).unwrap();

    device.lock().unwrap();
    device.lock().unwrap();
    assert!(host.advance());
    assert_eq!(device.pending_mixes(), 1);

    device.unlock().unwrap();
    assert_eq!(device.pending_mixes(), 1, "Inner unlock must not pay the mix");
    assert_eq!(device.stats().deferred_mixes, 1, "Only the priming mix so far");

    device.unlock().unwrap();
    assert_eq!(device.pending_mixes(), 0);
    assert_eq!(device.stats().deferred_mixes, 2);
    assert_eq!(device.lock_depth(), 0);
}

#[test]
fn test_unlock_pays_deferral_recorded_during_its_mix() {
    let host = SimulatedHost::with_capabilities(resubmit_only());
    let calls = Arc::new(AtomicUsize::new(0));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let counter = Arc::clone(&calls);
    let producer: ProducerCallback = Box::new(move |buffer: &mut [u8]| {
        // Call 1 primes; call 2 is the mix unlock pays for the deferral.
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }
        buffer.fill(0x44);
    });
    let device =
        OutputDevice::open(&host, stereo_16(), producer, &OutputConfig::default()).unwrap();

    device.lock().unwrap();
    assert!(host.advance());
    assert_eq!(device.pending_mixes(), 1);

    thread::scope(|scope| {
        let unlocking = scope.spawn(|| device.unlock());

        entered_rx.recv().unwrap();
        assert!(host.advance(), "Notification arrives while unlock is mixing");
        assert_eq!(device.pending_mixes(), 1);
        release_tx.send(()).unwrap();

        unlocking.join().unwrap().unwrap();
    });

    assert_eq!(device.lock_depth(), 0);
    assert_eq!(device.pending_mixes(), 0, "Unlock must leave nothing owed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(device.stats().deferred_mixes, 3, "Priming plus two paid deferrals");

    device.lock().unwrap();
    device.unlock().unwrap();
    assert_eq!(
        calls.load(Ordering::SeqCst),
        3,
        "Unlock with no notification in between must not mix"
    );
}

#[test]
fn test_unprimed_resubmit_starts_on_silence() {
    let host = SimulatedHost::with_capabilities(resubmit_only());
    let config = OutputConfig {
        prime_buffers: false,
        ..OutputConfig::default()
    };
    let _device = OutputDevice::open(&host, stereo_16(), constant(0x22), &config).unwrap();

    assert!(host.advance());
    let played = host.played();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].index, BufferIndex::Second);
    assert!(played[0].bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_drop_closes_channel() {
    let host = SimulatedHost::new();
    {
        let _device =
            OutputDevice::open(&host, stereo_16(), constant(0), &OutputConfig::default())
                .unwrap();
    }
    assert!(host.events().contains(&ChannelEvent::Disposed));
    assert!(host.buffers_released());
    assert!(!host.advance());
}

#[test]
fn test_custom_converter_ignored_when_not_needed() {
    struct Never;
    impl ConversionGate for Never {
        fn source_len(&self) -> usize {
            0
        }

        fn convert(&mut self, _scratch: &mut [u8]) -> usize {
            0
        }
    }

    let host = SimulatedHost::new();
    let device = OutputDevice::open_with_converter(
        &host,
        stereo_16(),
        constant(0x33),
        Box::new(Never),
        &OutputConfig::default(),
    )
    .unwrap();

    assert!(host.advance());
    assert!(device.fault().is_none());
}
