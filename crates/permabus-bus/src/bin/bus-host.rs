//! Standalone effects-host consumer loop.
//!
//! Attaches to a running synth's audio bus, requests takeover, and then
//! answers every published frame: the 16 channel streams are summed to
//! stereo, a gain is applied, and the result is returned as the mix the
//! synth plays out. The host's own per-frame processing time is published
//! back as its latency figure.
//!
//! This is the minimal well-behaved host; a real effects chain slots into
//! the spot where the gain is applied.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use permabus_bus::{clock, HostBus, DEFAULT_BUS_NAME, SLOT_SAMPLES};
use permabus_core::tunables::{HEARTBEAT_WINDOW, NUM_CHANNELS};

/// Attach to a synth's audio bus and take over its mix
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bus name to attach to
    #[arg(long, default_value = DEFAULT_BUS_NAME)]
    bus: String,

    /// Linear gain applied to the returned mix
    #[arg(long, default_value_t = 1.0)]
    gain: f32,

    /// Stop after this many frames (runs until the synth retires if omitted)
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

    let host = HostBus::attach(&args.bus)
        .with_context(|| format!("attaching to bus {}", args.bus))?;
    tracing::info!(bus = %args.bus, gain = args.gain, "attached");

    host.set_vst_active(true);
    if !host.request_takeover() {
        host.set_vst_active(false);
        bail!("synth refused takeover (releasing, or bus mutex stuck)");
    }
    tracing::info!("takeover requested; waiting for frames");

    let result = run(&host, &args);

    host.release_takeover();
    host.set_vst_active(false);
    tracing::info!("takeover released");
    result
}

fn run(host: &HostBus, args: &Args) -> Result<()> {
    let mut channel = vec![0.0f32; SLOT_SAMPLES];
    let mut mix = vec![0.0f32; SLOT_SAMPLES];
    let mut returned: u64 = 0;

    loop {
        if !host.synth_active() {
            tracing::info!("synth retired; exiting");
            break;
        }
        if !host.wait_audio_ready(HEARTBEAT_WINDOW) {
            // No frame inside the heartbeat window: either the synth is
            // back on direct output, or it is gone.
            if !host.synth_alive(HEARTBEAT_WINDOW) {
                tracing::warn!("synth heartbeat stale; exiting");
                break;
            }
            continue;
        }

        let started = clock::ticks();
        let samples = host.frame_samples();
        mix[..samples].fill(0.0);
        for ch in 0..NUM_CHANNELS {
            let copied = host.copy_channel(ch, &mut channel[..samples]);
            for (acc, sample) in mix[..copied].iter_mut().zip(&channel[..copied]) {
                *acc += *sample;
            }
        }
        for sample in &mut mix[..samples] {
            *sample = (*sample * args.gain).clamp(-1.0, 1.0);
        }

        host.write_mix(&mix[..samples]);
        host.publish_mix();
        host.set_permafrost_latency_us(clock::ticks_to_micros(started, clock::ticks()) as u32);

        returned += 1;
        if returned % 256 == 0 {
            tracing::debug!(returned, "frames returned");
        }
        if args.frames.is_some_and(|limit| returned >= limit) {
            tracing::info!(returned, "frame limit reached");
            break;
        }
    }
    Ok(())
}
