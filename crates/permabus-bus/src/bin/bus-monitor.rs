//! Meter and status dump for a running audio bus.
//!
//! Attaches read-mostly and prints what the synth publishes: takeover
//! state, heartbeat, frame counters, master and per-channel levels, voice
//! counts and latency figures. `--json` emits the snapshot as JSON for
//! scripting; `--watch` repeats on an interval.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use permabus_bus::{BusSnapshot, HostBus, DEFAULT_BUS_NAME};
use permabus_core::tunables::HEARTBEAT_WINDOW;

/// Print a snapshot of a synth's audio bus
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bus name to attach to
    #[arg(long, default_value = DEFAULT_BUS_NAME)]
    bus: String,

    /// Emit the snapshot as JSON
    #[arg(long)]
    json: bool,

    /// Repeat every N milliseconds until the synth retires
    #[arg(long)]
    watch: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let host = HostBus::attach(&args.bus)
        .with_context(|| format!("attaching to bus {}", args.bus))?;

    loop {
        let snapshot = host.snapshot();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            print_snapshot(&snapshot, host.synth_alive(HEARTBEAT_WINDOW));
        }

        match args.watch {
            Some(interval) if host.synth_active() => {
                std::thread::sleep(Duration::from_millis(interval));
            }
            _ => break,
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &BusSnapshot, alive: bool) {
    println!(
        "bus: {} @ {} Hz, {} samples/frame [{}]",
        snapshot.state,
        snapshot.sample_rate,
        snapshot.buffer_samples,
        if alive { "alive" } else { "stale" },
    );
    println!(
        "  heartbeat {}  frames out/in {}/{}  voices {}  cpu {:.1}%",
        snapshot.heartbeat,
        snapshot.out_frames,
        snapshot.in_frames,
        snapshot.total_voices,
        snapshot.cpu_usage,
    );
    println!(
        "  latency out {} us, host {} us",
        snapshot.output_latency_us, snapshot.permafrost_latency_us,
    );
    println!(
        "  master  L {:5.3} |{:<20}|  R {:5.3} |{:<20}|",
        snapshot.master_peak_l,
        bar(snapshot.master_peak_l),
        snapshot.master_peak_r,
        bar(snapshot.master_peak_r),
    );
    for (index, channel) in snapshot.channels.iter().enumerate() {
        if channel.voices == 0 && channel.peak_l == 0.0 && channel.peak_r == 0.0 {
            continue;
        }
        println!(
            "  ch {index:2}   L {:5.3} |{:<20}|  R {:5.3} |{:<20}|  {} voices",
            channel.peak_l,
            bar(channel.peak_l),
            channel.peak_r,
            bar(channel.peak_r),
            channel.voices,
        );
    }
}

fn bar(level: f32) -> String {
    let filled = (level.clamp(0.0, 1.0) * 20.0).round() as usize;
    "#".repeat(filled)
}
