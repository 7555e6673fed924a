//! permabus-sim - synth simulator.
//!
//! Stands in for the real synth so the bus can be exercised end to end:
//! creates the bus, runs sixteen tone generators through capture taps,
//! paces a frame loop at the configured rate, publishes meters and voice
//! counts, and wires the panic poller to a stub all-notes-off pathway.
//! Attach `bus-host` to hear (figuratively) the takeover path and
//! `bus-monitor` to watch the meters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use permabus_bus::{AudioBus, BusConfig, CaptureTap, FrameDriver, PanicPoller, DEFAULT_BUS_NAME};
use permabus_comms::{notice_channel, panic_channel, BusNotice};
use permabus_core::tunables::NUM_CHANNELS;
use permabus_core::EngineKind;

/// Simulated MIDI synth publishing to an audio bus
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bus name to create
    #[arg(long, default_value = DEFAULT_BUS_NAME)]
    bus: String,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 48_000)]
    rate: u32,

    /// Stereo frames per callback
    #[arg(long, default_value_t = 512)]
    block: usize,

    /// Stop after this many frames (runs until killed if omitted)
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "permabus=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(?args, "starting synth simulator");

    let bus = AudioBus::create(BusConfig {
        name: args.bus.clone(),
        sample_rate: args.rate,
        engine: EngineKind::Wav,
    })
    .context("creating the audio bus")?;

    let (panic_tx, panic_rx) = panic_channel();
    let poller = PanicPoller::spawn(
        bus.clone(),
        Duration::from_millis(50),
        panic_tx,
        || {
            // The real synth sends all-notes-off and resets controllers
            // here; the simulator just says so.
            tracing::warn!("PANIC: all notes off");
        },
    );

    run(&bus, &args, panic_rx)?;

    poller.stop();
    bus.shutdown();
    Ok(())
}

fn run(
    bus: &Arc<AudioBus>,
    args: &Args,
    panic_rx: permabus_comms::PanicReceiver,
) -> Result<()> {
    let (notice_tx, mut notice_rx) = notice_channel(64);
    let mut driver = FrameDriver::new(bus.clone(), notice_tx);

    let mut taps: Vec<CaptureTap> = (0..NUM_CHANNELS)
        .map(|channel| CaptureTap::new(bus.clone(), channel))
        .collect::<Option<_>>()
        .context("channel taps")?;
    let mut voices_per_channel = [0u32; NUM_CHANNELS];

    let mut generators: Vec<SineVoice> = (0..NUM_CHANNELS)
        .map(|channel| SineVoice::new(110.0 * (channel as f32 + 1.0), args.rate))
        .collect();

    let frame_period = Duration::from_secs_f64(args.block as f64 / f64::from(args.rate));
    let samples = args.block * 2;
    let mut chunk = vec![0.0f32; samples];
    let mut mix = vec![0.0f32; samples];
    let mut produced: u64 = 0;
    let mut next_frame = Instant::now();

    tracing::info!(
        block = args.block,
        period_ms = frame_period.as_millis() as u64,
        "frame loop running"
    );

    loop {
        // Synthesis: each channel renders its chunk through its tap and
        // into the synth's own mixdown.
        mix.fill(0.0);
        for (channel, (generator, tap)) in generators.iter_mut().zip(&mut taps).enumerate() {
            let amplitude = 0.5 / NUM_CHANNELS as f32;
            generator.render(&mut chunk, amplitude);
            tap.process(&chunk);
            for (out, sample) in mix.iter_mut().zip(&chunk) {
                *out += *sample;
            }
            voices_per_channel[channel] = 1 + (channel as u32 % 3);
        }
        bus.record_synth_complete();
        bus.set_all_voices(&voices_per_channel);

        // Frame boundary: a true return means the host's processed mix
        // replaced ours.
        let hosted = driver.process_frame(&mut mix);

        let (peak_l, peak_r) = stereo_peaks(&mix);
        let total_voices: u32 = voices_per_channel.iter().sum();
        driver.update_master(peak_l, peak_r, total_voices, 1.5);
        bus.record_audio_output();

        for notice in std::iter::from_fn(|| notice_rx.pop().ok()) {
            match notice {
                BusNotice::TakeoverEngaged => tracing::info!("host took over the mix"),
                BusNotice::TakeoverReleased(reason) => {
                    tracing::warn!(%reason, "takeover released");
                }
            }
        }
        for _ in panic_rx.try_iter() {
            tracing::info!("panic pathway completed");
        }

        produced += 1;
        if produced % 512 == 0 {
            tracing::debug!(produced, hosted, "frames");
        }
        if args.frames.is_some_and(|limit| produced >= limit) {
            tracing::info!(produced, "frame limit reached");
            return Ok(());
        }

        next_frame += frame_period;
        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        } else {
            // Fell behind (debugger, loaded machine): resynchronise.
            next_frame = now;
        }
    }
}

/// One per-channel test tone.
struct SineVoice {
    phase: f32,
    increment: f32,
}

impl SineVoice {
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            increment: frequency * 2.0 * std::f32::consts::PI / sample_rate as f32,
        }
    }

    /// Fill an interleaved stereo chunk, phase-continuous across calls.
    fn render(&mut self, interleaved: &mut [f32], amplitude: f32) {
        for pair in interleaved.chunks_exact_mut(2) {
            let sample = self.phase.sin() * amplitude;
            pair[0] = sample;
            pair[1] = sample;
            self.phase += self.increment;
            if self.phase >= 2.0 * std::f32::consts::PI {
                self.phase -= 2.0 * std::f32::consts::PI;
            }
        }
    }
}

fn stereo_peaks(interleaved: &[f32]) -> (f32, f32) {
    let mut peak_l = 0.0f32;
    let mut peak_r = 0.0f32;
    for pair in interleaved.chunks_exact(2) {
        peak_l = peak_l.max(pair[0].abs());
        peak_r = peak_r.max(pair[1].abs());
    }
    (peak_l, peak_r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_voice_phase_continuity() {
        let mut voice = SineVoice::new(440.0, 48_000);
        let mut a = vec![0.0f32; 64];
        let mut b = vec![0.0f32; 64];
        voice.render(&mut a, 1.0);
        voice.render(&mut b, 1.0);
        // The next chunk continues where the last one left off.
        let expected = (64.0 / 2.0 * voice.increment).sin();
        assert!((b[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_stereo_peaks() {
        let chunk = [0.2, -0.8, -0.4, 0.1];
        let (l, r) = stereo_peaks(&chunk);
        assert!((l - 0.4).abs() < f32::EPSILON);
        assert!((r - 0.8).abs() < f32::EPSILON);
    }
}
