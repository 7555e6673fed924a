//! Host-side view of the bus.
//!
//! The effects host attaches to a bus another process created, observes
//! meters and liveness, and may take over the mix: wait for `AudioReady`,
//! read the 16 out channels, write the processed stereo return, publish
//! it, and signal `ProcessedReady`.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;

use permabus_core::tunables::{NUM_CHANNELS, TAKEOVER_MUTEX_TIMEOUT};
use permabus_core::{ChannelCount, EngineKind};

use crate::bus::{apply_panic_request, apply_takeover_release, apply_takeover_request};
use crate::clock;
use crate::layout::{
    load_f32, BusHeader, TakeoverState, FLAG_ACTIVE, FLAG_PANIC_ACK, FLAG_VST_ACTIVE, REGION_SIZE,
    SLOT_SAMPLES,
};
use crate::region::{
    audio_ready_name, mutex_name, processed_ready_name, region_name, BusRegion, NamedEvent,
    NamedMutex, SharedMemory,
};
use crate::BusError;

/// Levels of one channel in a [`BusSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ChannelLevels {
    pub peak_l: f32,
    pub peak_r: f32,
    pub voices: u32,
}

/// Point-in-time copy of everything the host usually displays.
#[derive(Debug, Clone, Serialize)]
pub struct BusSnapshot {
    pub sample_rate: u32,
    pub buffer_samples: u32,
    pub engine: String,
    pub state: String,
    pub flags: u32,
    pub heartbeat: u64,
    pub last_update_ms: u64,
    pub out_frames: u64,
    pub in_frames: u64,
    pub master_peak_l: f32,
    pub master_peak_r: f32,
    pub total_voices: u32,
    pub cpu_usage: f32,
    pub output_latency_us: u32,
    pub permafrost_latency_us: u32,
    pub channels: Vec<ChannelLevels>,
}

/// The host process's handle on a synth's bus.
///
/// Attaching validates magic and version and refuses anything else; the
/// mapping's lifetime is independent of the synth's, which signals its
/// retirement by clearing the `Active` flag.
#[derive(Debug)]
pub struct HostBus {
    region: BusRegion,
}

impl HostBus {
    /// Attach to the bus under `name`.
    #[allow(unsafe_code)]
    pub fn attach(name: &str) -> Result<Self, BusError> {
        let shm = SharedMemory::open(&region_name(name), REGION_SIZE)?;
        {
            let header = unsafe { &*shm.as_ptr().cast::<BusHeader>() };
            header.validate()?;
        }
        let synth_pid = unsafe { &*shm.as_ptr().cast::<BusHeader>() }.synth_pid;

        let mutex = NamedMutex::open(&mutex_name(name)).map_err(BusError::Mutex)?;
        let audio_ready =
            NamedEvent::open(&audio_ready_name(name, synth_pid)).map_err(BusError::Event)?;
        let processed_ready =
            NamedEvent::open(&processed_ready_name(name, synth_pid)).map_err(BusError::Event)?;

        tracing::info!(name, synth_pid, "attached to audio bus");
        Ok(Self {
            region: BusRegion {
                shm,
                mutex,
                audio_ready,
                processed_ready,
            },
        })
    }

    /// Typed view of the shared header.
    pub fn header(&self) -> &BusHeader {
        self.region.header()
    }

    /// Whether the synth still advertises itself.
    pub fn synth_active(&self) -> bool {
        self.header().flags() & FLAG_ACTIVE != 0
    }

    /// Heartbeat watchdog: `Active` and updated within `window`.
    /// Advisory only; the transport's own liveness is the frame timeout
    /// and drift check on the synth side.
    pub fn synth_alive(&self, window: Duration) -> bool {
        let header = self.header();
        if header.flags() & FLAG_ACTIVE == 0 {
            return false;
        }
        let last = header.last_update_ms.load(Ordering::Relaxed);
        clock::millis().saturating_sub(last) <= window.as_millis() as u64
    }

    // ---- takeover --------------------------------------------------------

    /// Ask the synth for the mix. Committed at the synth's next frame
    /// boundary; until then the state reads `Pending`.
    pub fn request_takeover(&self) -> bool {
        let Some(_guard) = self.region.mutex.lock_timeout(TAKEOVER_MUTEX_TIMEOUT) else {
            return false;
        };
        let header = self.header();
        if header.state() == TakeoverState::Direct {
            // Catch the return counter up so lag left over from an
            // earlier session cannot trip the drift check on frame one.
            let out = header.out_frame_counter.load(Ordering::Acquire);
            let in_frames = header.in_frame_counter.load(Ordering::Acquire);
            if out > in_frames {
                header.in_frame_counter.store(out, Ordering::Release);
            }
        }
        apply_takeover_request(header)
    }

    /// Hand the mix back; the synth commits to `Direct` at its next frame
    /// boundary.
    pub fn release_takeover(&self) -> bool {
        let Some(_guard) = self.region.mutex.lock_timeout(TAKEOVER_MUTEX_TIMEOUT) else {
            return false;
        };
        apply_takeover_release(self.header())
    }

    // ---- frame consumption ----------------------------------------------

    /// Wait for the synth to publish a frame.
    pub fn wait_audio_ready(&self, timeout: Duration) -> bool {
        self.region.audio_ready.wait(timeout)
    }

    /// Valid interleaved f32 count of the current frame.
    pub fn frame_samples(&self) -> usize {
        (self
            .header()
            .current_frame_samples
            .load(Ordering::Acquire) as usize)
            .min(SLOT_SAMPLES)
    }

    /// Copy one channel of the frame the synth just published (the buffer
    /// opposite the synth's write index). Returns the f32 count copied.
    #[allow(unsafe_code)]
    pub fn copy_channel(&self, channel: ChannelCount, dst: &mut [f32]) -> usize {
        if channel >= NUM_CHANNELS {
            return 0;
        }
        let header = self.header();
        let buffer = ((header.out_write_index.load(Ordering::Acquire) ^ 1) & 1) as usize;
        header.out_read_index.store(buffer as i32, Ordering::Relaxed);
        let count = dst.len().min(self.frame_samples());
        let src = self.region.out_slot(channel, buffer);
        let published = unsafe { std::slice::from_raw_parts(src, count) };
        dst[..count].copy_from_slice(published);
        count
    }

    /// Write the processed stereo mix into the current in buffer. Returns
    /// the f32 count written. Follow with [`HostBus::publish_mix`].
    #[allow(unsafe_code)]
    pub fn write_mix(&self, interleaved: &[f32]) -> usize {
        let header = self.header();
        let buffer = (header.in_write_index.load(Ordering::Relaxed) & 1) as usize;
        let count = interleaved.len().min(SLOT_SAMPLES);
        let dst = self.region.in_slot(buffer);
        unsafe {
            std::ptr::copy_nonoverlapping(interleaved.as_ptr(), dst, count);
        }
        count
    }

    /// Publish the written mix: advance the write index past it, bump the
    /// frame counter, signal `ProcessedReady`.
    pub fn publish_mix(&self) {
        let header = self.header();
        let next = header.in_write_index.load(Ordering::Relaxed) ^ 1;
        header.in_write_index.store(next, Ordering::Release);
        header.in_frame_counter.fetch_add(1, Ordering::AcqRel);
        self.region.processed_ready.set();
    }

    // ---- host-written status --------------------------------------------

    /// Advertise (or retract) the host-side effect chain.
    pub fn set_vst_active(&self, active: bool) {
        let header = self.header();
        if active {
            header.flags.fetch_or(FLAG_VST_ACTIVE, Ordering::AcqRel);
        } else {
            header.flags.fetch_and(!FLAG_VST_ACTIVE, Ordering::AcqRel);
        }
    }

    /// Publish the host's own processing latency.
    pub fn set_permafrost_latency_us(&self, micros: u32) {
        self.header()
            .permafrost_latency_us
            .store(micros, Ordering::Relaxed);
    }

    // ---- panic channel ---------------------------------------------------

    /// Ask the synth for all-notes-off.
    pub fn request_panic(&self) {
        let _guard = self.region.mutex.lock();
        apply_panic_request(self.header());
        drop(_guard);
        tracing::debug!("panic requested");
    }

    /// Whether the synth has acknowledged the last panic request.
    pub fn panic_acknowledged(&self) -> bool {
        self.header().flags() & FLAG_PANIC_ACK != 0
    }

    /// Retire an observed acknowledgement. Skipped when the mutex is
    /// contended; returns whether the clear happened.
    pub fn clear_panic_ack(&self) -> bool {
        let Some(_guard) = self.region.mutex.try_lock() else {
            return false;
        };
        self.header()
            .flags
            .fetch_and(!FLAG_PANIC_ACK, Ordering::AcqRel);
        true
    }

    // ---- observation -----------------------------------------------------

    /// Copy out everything a meter display needs.
    pub fn snapshot(&self) -> BusSnapshot {
        let header = self.header();
        let channels = header
            .channels
            .iter()
            .map(|slot| ChannelLevels {
                peak_l: load_f32(&slot.peak_l),
                peak_r: load_f32(&slot.peak_r),
                voices: slot.voices.load(Ordering::Relaxed),
            })
            .collect();

        BusSnapshot {
            sample_rate: header.sample_rate.load(Ordering::Relaxed),
            buffer_samples: header.buffer_samples,
            engine: EngineKind::from_u32(header.current_engine.load(Ordering::Relaxed))
                .to_string(),
            state: format!("{:?}", header.state()),
            flags: header.flags(),
            heartbeat: header.heartbeat.load(Ordering::Relaxed),
            last_update_ms: header.last_update_ms.load(Ordering::Relaxed),
            out_frames: header.out_frame_counter.load(Ordering::Relaxed),
            in_frames: header.in_frame_counter.load(Ordering::Relaxed),
            master_peak_l: load_f32(&header.master_peak_l),
            master_peak_r: load_f32(&header.master_peak_r),
            total_voices: header.total_voices.load(Ordering::Relaxed),
            cpu_usage: load_f32(&header.cpu_usage),
            output_latency_us: header.output_latency_us.load(Ordering::Relaxed),
            permafrost_latency_us: header.permafrost_latency_us.load(Ordering::Relaxed),
            channels,
        }
    }
}
