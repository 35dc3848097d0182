use std::f32::consts::TAU;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use double_buffer_output::{
    init_logging, CycleStats, FormatDescriptor, FormatRequest, HostCapabilities, OutputConfig,
    OutputDevice, ProducerCallback, SampleFormat, SimulatedHost, Strategy, StrategyPreference,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "dbuf_demo",
    about = "Drive the double-buffered output core against a simulated or real sound host"
)]
struct Cli {
    /// JSON configuration file (defaults are used if missing)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct FormatArgs {
    /// Sample format the producer writes (u8, s8, u16lsb, s16lsb, u16msb, s16msb)
    #[arg(long, default_value = "s16lsb")]
    format: SampleFormat,
    #[arg(long, default_value_t = 2)]
    channels: u8,
    #[arg(long, default_value_t = 22050)]
    rate: u32,
    /// Frames per period
    #[arg(long, default_value_t = 512)]
    frames: u16,
    #[arg(long, value_enum, default_value_t = SignalKind::Tone)]
    signal: SignalKind,
    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
    /// Override the configured strategy (auto, resubmit, double-buffer)
    #[arg(long)]
    strategy: Option<StrategyPreference>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run notification cycles on the simulated host and report what played
    Simulate {
        #[command(flatten)]
        format: FormatArgs,
        #[arg(long, default_value_t = 32)]
        cycles: usize,
        /// Hold the lock across every Nth notification (0 = never)
        #[arg(long, default_value_t = 0)]
        lock_every: usize,
        /// Pretend the host only has callback commands
        #[arg(long)]
        legacy_host: bool,
        /// Write the JSON report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show which strategy a host with the given attributes would get
    Probe {
        #[arg(long, default_value_t = 3)]
        manager_major: u8,
        #[arg(long)]
        play_double_buffer: bool,
        #[arg(long)]
        has_asc: bool,
        #[arg(long)]
        callback_commands: bool,
    },
    /// Play through the default output device
    #[cfg(feature = "cpal-host")]
    Play {
        #[command(flatten)]
        format: FormatArgs,
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
        /// Output device name (defaults to the system default output)
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SignalKind {
    Tone,
    Noise,
    Silence,
}

#[derive(Serialize)]
struct SimulationReport {
    strategy: Strategy,
    descriptor: FormatDescriptor,
    cycles: usize,
    played_periods: usize,
    underruns: usize,
    silent_periods: usize,
    dropped_periods: u64,
    stats: CycleStats,
    fault: Option<String>,
}

#[derive(Serialize)]
struct ProbeReport {
    capabilities: HostCapabilities,
    supports_double_buffer: bool,
    supports_resubmit: bool,
    selected: Option<Strategy>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli
        .config
        .map(OutputConfig::load_from_file)
        .unwrap_or_default();
    init_logging(config.log_level);

    match cli.command {
        Commands::Simulate {
            format,
            cycles,
            lock_every,
            legacy_host,
            output,
        } => run_simulate(&config, &format, cycles, lock_every, legacy_host, output),
        Commands::Probe {
            manager_major,
            play_double_buffer,
            has_asc,
            callback_commands,
        } => run_probe(
            &config,
            HostCapabilities {
                manager_major,
                play_double_buffer,
                has_asc,
                callback_commands,
            },
        ),
        #[cfg(feature = "cpal-host")]
        Commands::Play {
            format,
            seconds,
            device,
        } => run_play(&config, &format, seconds, device),
    }
}

fn effective_config(config: &OutputConfig, format: &FormatArgs) -> OutputConfig {
    let mut config = config.clone();
    if let Some(strategy) = format.strategy {
        config.strategy = strategy;
    }
    config
}

fn run_simulate(
    config: &OutputConfig,
    format: &FormatArgs,
    cycles: usize,
    lock_every: usize,
    legacy_host: bool,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let config = effective_config(config, format);
    let capabilities = if legacy_host {
        HostCapabilities {
            manager_major: 2,
            play_double_buffer: false,
            has_asc: false,
            callback_commands: true,
        }
    } else {
        HostCapabilities {
            manager_major: 3,
            play_double_buffer: true,
            has_asc: false,
            callback_commands: true,
        }
    };
    let host = SimulatedHost::with_tap(capabilities, config.playback_tap_periods);

    let request = FormatRequest::new(format.format, format.channels, format.rate, format.frames);
    let mut device = OutputDevice::open(&host, request, producer_for(format), &config)
        .context("opening simulated output")?;

    let mut played = Vec::new();
    let mut delivered = 0;
    for cycle in 1..=cycles {
        let hold = lock_every > 0 && cycle % lock_every == 0;
        if hold {
            device.lock().context("lock")?;
        }
        if host.advance() {
            delivered += 1;
        }
        if hold {
            device.unlock().context("unlock")?;
        }
        played.extend(host.played());
    }

    let stats = device.stats();
    let report = SimulationReport {
        strategy: device.strategy(),
        descriptor: *device.descriptor(),
        cycles: delivered,
        played_periods: played.len(),
        underruns: played.iter().filter(|period| period.underrun).count(),
        silent_periods: played
            .iter()
            .filter(|period| period.bytes.iter().all(|&b| b == silence_byte(format.format)))
            .count(),
        dropped_periods: host.dropped_periods(),
        stats,
        fault: device.close().err().map(|err| err.to_string()),
    };

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => fs::write(&path, json)
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{}", json),
    }

    if report.fault.is_some() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::from(0))
    }
}

fn run_probe(config: &OutputConfig, capabilities: HostCapabilities) -> Result<ExitCode> {
    let report = ProbeReport {
        capabilities,
        supports_double_buffer: capabilities.supports_double_buffer(),
        supports_resubmit: capabilities.supports_resubmit(),
        selected: config.strategy.select(&capabilities),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(0))
}

#[cfg(feature = "cpal-host")]
fn run_play(
    config: &OutputConfig,
    format: &FormatArgs,
    seconds: f32,
    device: Option<String>,
) -> Result<ExitCode> {
    use anyhow::bail;

    if seconds.is_nan() || seconds <= 0.0 {
        bail!("--seconds must be positive");
    }
    let config = effective_config(config, format);
    let host = cpal_host(device);
    log::info!(
        "[dbuf_demo] playing on {}",
        host.device_name().unwrap_or("the default output device")
    );
    let request = FormatRequest::new(format.format, format.channels, format.rate, format.frames);
    let mut device = OutputDevice::open(&host, request, producer_for(format), &config)
        .context("opening output device")?;

    std::thread::sleep(std::time::Duration::from_secs_f32(seconds));

    let stats = device.stats();
    device.close().context("playback failed")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(ExitCode::from(0))
}

#[cfg(feature = "cpal-host")]
fn cpal_host(device: Option<String>) -> double_buffer_output::CpalHost {
    use double_buffer_output::CpalHost;

    match device {
        Some(name) => CpalHost::with_device(name),
        None => CpalHost::new(),
    }
}

/// Byte that encodes zero amplitude in `format`, for the silence check.
fn silence_byte(format: SampleFormat) -> u8 {
    // Hardware formats are either unsigned 8-bit or signed 16-bit.
    if format.coerce() == SampleFormat::U8 {
        0x80
    } else {
        0
    }
}

fn producer_for(args: &FormatArgs) -> ProducerCallback {
    let format = args.format;
    let channels = usize::from(args.channels.max(1));
    let kind = args.signal;
    let step = args.frequency / args.rate.max(1) as f32;
    let mut phase = 0.0f32;
    let mut rng = StdRng::from_entropy();

    Box::new(move |buffer: &mut [u8]| {
        let frame_bytes = channels * format.bytes_per_sample();
        for frame in buffer.chunks_exact_mut(frame_bytes) {
            let value = match kind {
                SignalKind::Tone => {
                    let value = (phase * TAU).sin() * 0.25;
                    phase = (phase + step).fract();
                    value
                }
                SignalKind::Noise => rng.gen_range(-0.25f32..0.25),
                SignalKind::Silence => 0.0,
            };
            for sample in frame.chunks_exact_mut(format.bytes_per_sample()) {
                encode(format, value, sample);
            }
        }
    })
}

fn encode(format: SampleFormat, value: f32, out: &mut [u8]) {
    let wide = (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
    let narrow = (wide >> 8) as i8;
    match format {
        SampleFormat::U8 => out[0] = (narrow as u8) ^ 0x80,
        SampleFormat::S8 => out[0] = narrow as u8,
        SampleFormat::S16Lsb => out.copy_from_slice(&wide.to_le_bytes()),
        SampleFormat::S16Msb => out.copy_from_slice(&wide.to_be_bytes()),
        SampleFormat::U16Lsb => out.copy_from_slice(&((wide as u16) ^ 0x8000).to_le_bytes()),
        SampleFormat::U16Msb => out.copy_from_slice(&((wide as u16) ^ 0x8000).to_be_bytes()),
    }
}

#[cfg(all(test, feature = "cpal-host"))]
mod tests {
    use super::*;

    #[test]
    fn test_play_device_flag_selects_named_host() {
        let cli = Cli::try_parse_from(["dbuf_demo", "play", "--device", "USB Audio"]).unwrap();
        match cli.command {
            Commands::Play { device, .. } => {
                let host = cpal_host(device);
                assert_eq!(host.device_name(), Some("USB Audio"));
            }
            other => panic!("Expected play, got {:?}", other),
        }
    }

    #[test]
    fn test_play_without_device_uses_default() {
        let cli = Cli::try_parse_from(["dbuf_demo", "play"]).unwrap();
        match cli.command {
            Commands::Play { device, .. } => assert_eq!(cpal_host(device).device_name(), None),
            other => panic!("Expected play, got {:?}", other),
        }
    }
}
