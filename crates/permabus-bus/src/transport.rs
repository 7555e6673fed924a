//! Realtime side of the bus: capture taps and the frame-boundary driver.
//!
//! Everything here runs inside the synth's audio path. The rules are the
//! usual ones for that context: no blocking beyond the bounded frame wait,
//! no allocation, no locks, no logging. Incidents are pushed as
//! [`BusNotice`] values for the management thread to drain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use permabus_comms::{BusNotice, NoticeSender, ReleaseReason};
use permabus_core::tunables::{FRAME_TIMEOUT, MAX_FRAME_DRIFT, NUM_CHANNELS};
use permabus_core::ChannelCount;

use crate::bus::AudioBus;
use crate::clock;
use crate::layout::{store_f32, TakeoverState, FLAG_AUDIO_ENABLED, SLOT_SAMPLES};
use crate::meters::{scan_peaks, StereoSmoother};

/// Per-channel capture hook.
///
/// The synthesis engine holds one tap per channel and feeds it each chunk
/// of that channel's interleaved stereo output. Outside takeover the tap
/// returns immediately; during takeover it meters the chunk and copies it
/// into the current out buffer.
pub struct CaptureTap {
    bus: Arc<AudioBus>,
    channel: ChannelCount,
    meter: StereoSmoother,
}

impl CaptureTap {
    /// Tap for one channel; `None` for an out-of-range index.
    #[must_use]
    pub fn new(bus: Arc<AudioBus>, channel: ChannelCount) -> Option<Self> {
        (channel < NUM_CHANNELS).then_some(Self {
            bus,
            channel,
            meter: StereoSmoother::default(),
        })
    }

    #[must_use]
    pub fn channel(&self) -> ChannelCount {
        self.channel
    }

    /// Feed one interleaved stereo chunk.
    ///
    /// A chunk shorter than the exchange buffer leaves the remainder of
    /// the slot untouched; the host reads the header's current frame
    /// sample count to know how much is valid. Anything longer is
    /// truncated to the slot.
    #[allow(unsafe_code)]
    pub fn process(&mut self, interleaved: &[f32]) {
        let header = self.bus.header();
        if header.state() != TakeoverState::Active {
            return;
        }

        let (peak_l, peak_r) = scan_peaks(interleaved);
        let (smoothed_l, smoothed_r) = self.meter.update(peak_l, peak_r);
        let slot = &header.channels[self.channel];
        store_f32(&slot.peak_l, smoothed_l);
        store_f32(&slot.peak_r, smoothed_r);

        let buffer = (header.out_write_index.load(Ordering::Acquire) & 1) as usize;
        let count = interleaved.len().min(SLOT_SAMPLES);
        let dst = self.bus.region().out_slot(self.channel, buffer);
        // Single producer per channel slot; the host reads the opposite
        // buffer until the driver's swap publishes this one.
        unsafe {
            std::ptr::copy_nonoverlapping(interleaved.as_ptr(), dst, count);
        }
    }
}

/// The frame-boundary handler, owned by the audio callback.
///
/// Once per output frame the synth calls [`FrameDriver::process_frame`]
/// with its own mixdown; a `true` return means the buffer now holds the
/// host's processed stereo instead.
pub struct FrameDriver {
    bus: Arc<AudioBus>,
    notices: NoticeSender,
    master: StereoSmoother,
}

impl FrameDriver {
    #[must_use]
    pub fn new(bus: Arc<AudioBus>, notices: NoticeSender) -> Self {
        Self {
            bus,
            notices,
            master: StereoSmoother::default(),
        }
    }

    /// Run one frame of the exchange protocol.
    ///
    /// Advances the takeover state machine and bumps the heartbeat; in
    /// `Active` it then publishes the out buffers, signals the host,
    /// waits the bounded frame timeout and copies the processed return
    /// into `mix`. Every failure path releases takeover and returns
    /// `false`, leaving `mix` (the synth's own mixdown) untouched.
    pub fn process_frame(&mut self, mix: &mut [f32]) -> bool {
        let header = self.bus.header();

        // Commits of Pending and Releasing happen only here, at a frame
        // boundary, which is what lets them skip the mutex: the driver is
        // the single writer of these transitions.
        match header.state() {
            TakeoverState::Pending => {
                // Stale signals from a previous host session must not
                // satisfy this session's first waits.
                self.bus.region().processed_ready.drain();
                header.set_state(TakeoverState::Active);
                let _ = self.notices.push(BusNotice::TakeoverEngaged);
            }
            TakeoverState::Releasing => {
                header.set_state(TakeoverState::Direct);
                header
                    .flags
                    .fetch_and(!FLAG_AUDIO_ENABLED, Ordering::AcqRel);
            }
            TakeoverState::Direct | TakeoverState::Active => {}
        }

        header.heartbeat.fetch_add(1, Ordering::AcqRel);

        if header.state() != TakeoverState::Active {
            return false;
        }

        // Drift check runs before the swap so a lagging host does not
        // consume another frame slot.
        let out_frames = header.out_frame_counter.load(Ordering::Acquire);
        let in_frames = header.in_frame_counter.load(Ordering::Acquire);
        if out_frames > in_frames + MAX_FRAME_DRIFT {
            self.release(ReleaseReason::FrameDrift {
                out_frames,
                in_frames,
            });
            return false;
        }

        // Publish: swap the write index, then the counter, then the
        // event, so a host that wakes sees a complete frame.
        let next = header.out_write_index.load(Ordering::Relaxed) ^ 1;
        header.out_write_index.store(next, Ordering::Release);
        header.out_frame_counter.fetch_add(1, Ordering::AcqRel);
        header
            .current_frame_samples
            .store(mix.len().min(SLOT_SAMPLES) as u32, Ordering::Release);
        header
            .last_shmem_write_ticks
            .store(clock::ticks(), Ordering::Relaxed);
        self.bus.region().audio_ready.set();

        if !self.bus.region().processed_ready.wait(FRAME_TIMEOUT) {
            self.release(ReleaseReason::HostTimeout);
            return false;
        }

        self.copy_processed(mix);
        header
            .last_shmem_read_ticks
            .store(clock::ticks(), Ordering::Relaxed);
        true
    }

    /// Publish the master meters, voice total and CPU figure. Smoothing
    /// happens here; the header write is skipped when the mutex is
    /// contended (metering freshness never outranks audio continuity).
    pub fn update_master(&mut self, peak_l: f32, peak_r: f32, voices: u32, cpu: f32) {
        let (l, r) = self.master.update(peak_l, peak_r);
        let Some(_guard) = self.bus.region().mutex.try_lock() else {
            return;
        };
        let header = self.bus.header();
        store_f32(&header.master_peak_l, l);
        store_f32(&header.master_peak_r, r);
        header.total_voices.store(voices, Ordering::Relaxed);
        store_f32(&header.cpu_usage, cpu);
        header
            .last_update_ms
            .store(clock::millis(), Ordering::Relaxed);
    }

    /// Copy the buffer the host just finished into `mix` (the opposite of
    /// the host's write index, which advanced past it on publication).
    #[allow(unsafe_code)]
    fn copy_processed(&self, mix: &mut [f32]) {
        let header = self.bus.header();
        let buffer = ((header.in_write_index.load(Ordering::Acquire) ^ 1) & 1) as usize;
        header.in_read_index.store(buffer as i32, Ordering::Relaxed);
        let count = mix.len().min(SLOT_SAMPLES);
        let src = self.bus.region().in_slot(buffer);
        let processed = unsafe { std::slice::from_raw_parts(src, count) };
        mix[..count].copy_from_slice(processed);
    }

    /// Liveness release from inside the frame path: the state word is a
    /// single atomic, so no mutex is needed (or allowed) here.
    fn release(&mut self, reason: ReleaseReason) {
        self.bus.header().set_state(TakeoverState::Releasing);
        let _ = self.notices.push(BusNotice::TakeoverReleased(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::host::HostBus;
    use crate::layout::FLAG_ACTIVE;
    use crate::region::{audio_ready_name, processed_ready_name, test_bus_name, NamedEvent};
    use permabus_comms::notice_channel;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const TEST_FRAME: usize = 512; // interleaved f32s per test frame

    fn bus_with_name(tag: &str) -> (Arc<AudioBus>, String) {
        let name = test_bus_name(tag);
        let bus = AudioBus::create(BusConfig {
            name: name.clone(),
            ..BusConfig::default()
        })
        .expect("create bus");
        (bus, name)
    }

    /// Host stub that answers every published frame with a constant-valued
    /// mix until stopped.
    fn spawn_echo_host(
        host: HostBus,
        stop: Arc<AtomicBool>,
        fill: f32,
    ) -> std::thread::JoinHandle<HostBus> {
        std::thread::spawn(move || {
            let mut mix = vec![0.0f32; SLOT_SAMPLES];
            while !stop.load(Ordering::Relaxed) {
                if !host.wait_audio_ready(Duration::from_millis(100)) {
                    continue;
                }
                let samples = host.frame_samples();
                mix[..samples].fill(fill);
                host.write_mix(&mix[..samples]);
                host.publish_mix();
            }
            host
        })
    }

    #[test]
    fn test_cold_start_without_host() {
        let (bus, _) = bus_with_name("cold");
        let (tx, _rx) = notice_channel(16);
        let mut driver = FrameDriver::new(bus.clone(), tx);

        let mut mix = vec![0.25f32; TEST_FRAME];
        for _ in 0..10 {
            assert!(!driver.process_frame(&mut mix));
        }

        let header = bus.header();
        assert_eq!(header.heartbeat.load(Ordering::Relaxed), 10);
        assert_eq!(header.out_frame_counter.load(Ordering::Relaxed), 0);
        assert_eq!(header.state(), TakeoverState::Direct);
        // The synth's own mix was left alone.
        assert!(mix.iter().all(|&s| (s - 0.25).abs() < f32::EPSILON));
    }

    #[test]
    fn test_takeover_round_trip() {
        let (bus, name) = bus_with_name("trip");
        let host = HostBus::attach(&name).expect("attach");
        assert!(host.request_takeover());
        assert_eq!(bus.header().state(), TakeoverState::Pending);
        assert_ne!(bus.header().flags() & FLAG_AUDIO_ENABLED, 0);

        let stop = Arc::new(AtomicBool::new(false));
        let stub = spawn_echo_host(host, stop.clone(), 0.5);

        let (tx, mut rx) = notice_channel(16);
        let mut driver = FrameDriver::new(bus.clone(), tx);
        let mut tap = CaptureTap::new(bus.clone(), 0).expect("tap");

        let mut mix = vec![0.0f32; TEST_FRAME];
        for frame in 0..5 {
            mix.fill(0.1);
            tap.process(&[0.3; TEST_FRAME]);
            assert!(driver.process_frame(&mut mix), "frame {frame}");
            // The buffer now holds the host's mix, not the synth's.
            assert!(mix.iter().all(|&s| (s - 0.5).abs() < f32::EPSILON));
            // The buffer read is the one the host wrote.
            let header = bus.header();
            assert_ne!(
                header.in_read_index.load(Ordering::Relaxed),
                header.in_write_index.load(Ordering::Relaxed)
            );
        }

        let header = bus.header();
        assert_eq!(header.state(), TakeoverState::Active);
        assert_eq!(header.out_frame_counter.load(Ordering::Relaxed), 5);
        assert_eq!(header.in_frame_counter.load(Ordering::Relaxed), 5);
        assert_eq!(rx.pop().ok(), Some(BusNotice::TakeoverEngaged));

        stop.store(true, Ordering::Relaxed);
        stub.join().expect("stub");
    }

    #[test]
    fn test_host_crash_releases() {
        let (bus, name) = bus_with_name("crash");
        let host = HostBus::attach(&name).expect("attach");
        assert!(host.request_takeover());

        let stop = Arc::new(AtomicBool::new(false));
        let stub = spawn_echo_host(host, stop.clone(), 0.5);

        let (tx, mut rx) = notice_channel(16);
        let mut driver = FrameDriver::new(bus.clone(), tx);
        let mut mix = vec![0.0f32; TEST_FRAME];

        assert!(driver.process_frame(&mut mix));
        assert_eq!(bus.header().state(), TakeoverState::Active);

        // Host "crashes".
        stop.store(true, Ordering::Relaxed);
        drop(stub.join().expect("stub"));

        // Next frame times out and releases...
        mix.fill(0.1);
        assert!(!driver.process_frame(&mut mix));
        assert_eq!(bus.header().state(), TakeoverState::Releasing);
        assert!(mix.iter().all(|&s| (s - 0.1).abs() < f32::EPSILON));

        // ...and the one after commits back to Direct.
        assert!(!driver.process_frame(&mut mix));
        assert_eq!(bus.header().state(), TakeoverState::Direct);
        assert_eq!(bus.header().flags() & FLAG_AUDIO_ENABLED, 0);

        assert_eq!(rx.pop().ok(), Some(BusNotice::TakeoverEngaged));
        assert_eq!(
            rx.pop().ok(),
            Some(BusNotice::TakeoverReleased(ReleaseReason::HostTimeout))
        );
    }

    #[test]
    fn test_frame_drift_releases() {
        let (bus, name) = bus_with_name("drift");
        let pid = std::process::id();

        // A host that signals completion but never advances its frame
        // counter: opens the raw events instead of using HostBus.
        let audio = NamedEvent::open(&audio_ready_name(&name, pid)).expect("audio event");
        let processed = NamedEvent::open(&processed_ready_name(&name, pid)).expect("processed");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_stub = stop.clone();
        let stub = std::thread::spawn(move || {
            while !stop_stub.load(Ordering::Relaxed) {
                if audio.wait(Duration::from_millis(100)) {
                    processed.set();
                }
            }
        });

        assert!(bus.request_takeover());
        let (tx, mut rx) = notice_channel(16);
        let mut driver = FrameDriver::new(bus.clone(), tx);
        let mut mix = vec![0.0f32; TEST_FRAME];

        // The drift check compares counters before each swap, so four
        // frames go through before the gap exceeds the threshold.
        for frame in 0..4 {
            assert!(driver.process_frame(&mut mix), "frame {frame}");
        }
        assert!(!driver.process_frame(&mut mix));
        assert_eq!(bus.header().state(), TakeoverState::Releasing);

        assert_eq!(rx.pop().ok(), Some(BusNotice::TakeoverEngaged));
        assert_eq!(
            rx.pop().ok(),
            Some(BusNotice::TakeoverReleased(ReleaseReason::FrameDrift {
                out_frames: 4,
                in_frames: 0,
            }))
        );

        stop.store(true, Ordering::Relaxed);
        stub.join().expect("stub");
    }

    #[test]
    fn test_tap_idle_outside_takeover() {
        let (bus, _) = bus_with_name("tapidle");
        let mut tap = CaptureTap::new(bus.clone(), 3).expect("tap");
        tap.process(&[1.0; 64]);
        // Nothing published: state is Direct.
        let slot = &bus.header().channels[3];
        assert_eq!(slot.peak_l.load(Ordering::Relaxed), 0);
        assert_eq!(slot.peak_r.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_tap_rejects_bad_channel() {
        let (bus, _) = bus_with_name("tapbad");
        assert!(CaptureTap::new(bus.clone(), NUM_CHANNELS).is_none());
        assert!(CaptureTap::new(bus, NUM_CHANNELS - 1).is_some());
    }

    #[test]
    fn test_master_meter_decay_published() {
        let (bus, _) = bus_with_name("meter");
        let (tx, _rx) = notice_channel(4);
        let mut driver = FrameDriver::new(bus.clone(), tx);

        driver.update_master(1.0, 1.0, 64, 12.5);
        for _ in 0..9 {
            driver.update_master(0.0, 0.0, 64, 12.5);
        }

        let header = bus.header();
        let expected = permabus_core::tunables::METER_DECAY.powi(9);
        let left = f32::from_bits(header.master_peak_l.load(Ordering::Relaxed));
        assert!((left - expected).abs() < 1e-6);
        assert_eq!(header.total_voices.load(Ordering::Relaxed), 64);
        assert!(header.last_update_ms.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_heartbeat_survives_shutdown_state() {
        let (bus, _) = bus_with_name("hb");
        let (tx, _rx) = notice_channel(4);
        let mut driver = FrameDriver::new(bus.clone(), tx);
        let mut mix = vec![0.0f32; TEST_FRAME];

        driver.process_frame(&mut mix);
        bus.shutdown();
        // The bus is down but the frame path must stay harmless.
        assert!(!driver.process_frame(&mut mix));
        assert_eq!(bus.header().flags() & FLAG_ACTIVE, 0);
        assert_eq!(bus.header().heartbeat.load(Ordering::Relaxed), 2);
    }
}
