//! Synth-side ownership of the bus.
//!
//! [`AudioBus`] creates the region, stamps the header, and exposes every
//! management- and MIDI-thread operation: format publication, latency
//! stamps, voice counts, the panic channel, and external takeover
//! requests. The realtime pieces live in [`crate::transport`] and borrow
//! the bus through an `Arc`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use permabus_core::tunables::{
    BUFFER_SAMPLES, NUM_CHANNELS, TAKEOVER_MUTEX_TIMEOUT,
};
use permabus_core::{ChannelCount, EngineKind, SampleRate};

use crate::clock;
use crate::layout::{
    BusHeader, TakeoverState, BUS_MAGIC, BUS_VERSION, FLAG_ACTIVE, FLAG_AUDIO_ENABLED,
    FLAG_PANIC_ACK, FLAG_PANIC_REQUEST, REGION_SIZE,
};
use crate::region::{BusRegion, DEFAULT_BUS_NAME};
use crate::BusError;

/// Creation-time parameters of a bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Base name for the region, mutex and events. The default is the
    /// well-known production name; tests use unique names so independent
    /// regions can coexist in one process.
    pub name: String,
    /// Initial sample rate published in the header.
    pub sample_rate: SampleRate,
    /// Initial engine id published in the header.
    pub engine: EngineKind,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUS_NAME.to_string(),
            sample_rate: 48_000,
            engine: EngineKind::Wav,
        }
    }
}

/// The synth's handle on the bus. Creating it creates every OS object;
/// dropping it marks the bus inactive and unlinks them.
///
/// Share it with `Arc` across the synth's threads. Creating two buses
/// under the same name is a caller error: the second creation replaces
/// the first one's named objects.
pub struct AudioBus {
    region: BusRegion,
    config: BusConfig,
}

impl AudioBus {
    /// Create a fresh bus: region zeroed, magic and version stamped,
    /// `Active` set, state `Direct`. On any partial failure every object
    /// acquired so far is released before the error returns.
    #[allow(unsafe_code)]
    pub fn create(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let pid = std::process::id();
        let region = BusRegion::create(&config.name, pid, REGION_SIZE)?;

        {
            // Fresh mapping, not yet visible to a peer that could hold a
            // reference: plain writes to the one-shot fields are fine.
            let header = unsafe { &mut *region.shm.as_ptr().cast::<BusHeader>() };
            header.magic = BUS_MAGIC;
            header.version = BUS_VERSION;
            header.synth_pid = pid;
            header.buffer_samples = BUFFER_SAMPLES as u32;
            header.num_channels = NUM_CHANNELS as u32;
            header
                .sample_rate
                .store(config.sample_rate, Ordering::Relaxed);
            header
                .current_engine
                .store(config.engine as u32, Ordering::Relaxed);
            header
                .tick_frequency
                .store(clock::TICKS_PER_SEC, Ordering::Relaxed);
            header.last_update_ms.store(clock::millis(), Ordering::Relaxed);
            header.set_state(TakeoverState::Direct);
            // Publishing Active is the last store; a host that sees it
            // sees a complete header.
            header.flags.store(FLAG_ACTIVE, Ordering::Release);
        }

        tracing::info!(
            name = %config.name,
            pid,
            sample_rate = config.sample_rate,
            "audio bus created"
        );
        Ok(Arc::new(Self { region, config }))
    }

    /// Typed view of the shared header.
    pub fn header(&self) -> &BusHeader {
        self.region.header()
    }

    pub(crate) fn region(&self) -> &BusRegion {
        &self.region
    }

    /// Whether the bus is up (created and not yet shut down).
    pub fn is_connected(&self) -> bool {
        self.header().flags() & FLAG_ACTIVE != 0
    }

    /// Mark the bus inactive and force the state back to `Direct`.
    ///
    /// Called by `Drop`; safe to call early and more than once. The mutex
    /// wait is bounded so a crashed peer holding it cannot block
    /// shutdown; on expiry the flags are cleared anyway.
    pub fn shutdown(&self) {
        let header = self.header();
        if header.flags() & FLAG_ACTIVE == 0 {
            return;
        }
        let guard = self.region.mutex.lock_timeout(TAKEOVER_MUTEX_TIMEOUT);
        if guard.is_none() {
            tracing::warn!("bus mutex busy at shutdown, proceeding anyway");
        }
        header.flags.store(0, Ordering::Release);
        header.set_state(TakeoverState::Direct);
        drop(guard);
        tracing::info!(name = %self.config.name, "audio bus shut down");
    }

    // ---- format & latency ------------------------------------------------

    /// Republish the sample rate (engine reconfiguration).
    pub fn set_sample_rate(&self, rate: SampleRate) {
        let _guard = self.region.mutex.lock();
        let header = self.header();
        header.sample_rate.store(rate, Ordering::Relaxed);
        header.last_update_ms.store(clock::millis(), Ordering::Relaxed);
        drop(_guard);
        tracing::info!(rate, "bus sample rate updated");
    }

    /// Publish latency figures and the engine id together. Skipped
    /// silently when the mutex is contended; the next periodic call
    /// catches up.
    pub fn set_latency_info(&self, output_us: u32, asio_input_us: u32, engine: EngineKind) {
        let Some(_guard) = self.region.mutex.try_lock() else {
            return;
        };
        let header = self.header();
        header.output_latency_us.store(output_us, Ordering::Relaxed);
        header
            .asio_input_latency_us
            .store(asio_input_us, Ordering::Relaxed);
        header
            .current_engine
            .store(engine as u32, Ordering::Relaxed);
    }

    // ---- event-time stamps ----------------------------------------------

    /// Stamp the arrival of a MIDI event. Lock-free; called from the MIDI
    /// thread.
    pub fn record_midi_event(&self) {
        self.header()
            .last_midi_event_ticks
            .store(clock::ticks(), Ordering::Relaxed);
    }

    /// Stamp the completion of a synthesis buffer.
    pub fn record_synth_complete(&self) {
        self.header()
            .last_synth_complete_ticks
            .store(clock::ticks(), Ordering::Relaxed);
    }

    /// Stamp the hand-off of audio to the output device.
    pub fn record_audio_output(&self) {
        self.header()
            .last_audio_output_ticks
            .store(clock::ticks(), Ordering::Relaxed);
    }

    // ---- voice counts ----------------------------------------------------

    /// Publish one channel's voice count. Out-of-range channels are
    /// ignored.
    pub fn set_channel_voices(&self, channel: ChannelCount, voices: u32) {
        if let Some(slot) = self.header().channel(channel) {
            slot.voices.store(voices, Ordering::Relaxed);
        }
    }

    /// Publish every channel's voice count and the derived total in one
    /// consistent update. Skipped silently when the mutex is contended.
    pub fn set_all_voices(&self, voices: &[u32; NUM_CHANNELS]) {
        let Some(_guard) = self.region.mutex.try_lock() else {
            return;
        };
        let header = self.header();
        let mut total = 0u32;
        for (slot, &count) in header.channels.iter().zip(voices) {
            slot.voices.store(count, Ordering::Relaxed);
            total += count;
        }
        header.total_voices.store(total, Ordering::Relaxed);
    }

    // ---- panic channel ---------------------------------------------------

    /// Raise the panic request (host-side semantics, exposed here for
    /// in-process use).
    pub fn request_panic(&self) {
        let _guard = self.region.mutex.lock();
        apply_panic_request(self.header());
        drop(_guard);
        tracing::debug!("panic requested on the bus");
    }

    /// Whether a panic request is pending. Lock-free.
    pub fn check_panic_request(&self) -> bool {
        self.header().flags() & FLAG_PANIC_REQUEST != 0
    }

    /// Acknowledge a handled panic: clears the request, sets the ack, in
    /// one transition under the mutex.
    pub fn acknowledge_panic(&self) {
        let _guard = self.region.mutex.lock();
        let _ = self
            .header()
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                Some((f & !FLAG_PANIC_REQUEST) | FLAG_PANIC_ACK)
            });
        drop(_guard);
        tracing::debug!("panic acknowledged");
    }

    /// Drop the ack bit once the peer has observed it. Skipped when the
    /// mutex is contended; returns whether the clear happened.
    pub fn clear_panic_ack(&self) -> bool {
        let Some(_guard) = self.region.mutex.try_lock() else {
            return false;
        };
        self.header()
            .flags
            .fetch_and(!FLAG_PANIC_ACK, Ordering::AcqRel);
        true
    }

    // ---- takeover --------------------------------------------------------

    /// Ask for takeover; commits to `Active` at the synth's next frame
    /// boundary. No-op when already pending or engaged; refused while a
    /// release is still in flight or the mutex stays contended past the
    /// bound.
    pub fn request_takeover(&self) -> bool {
        let Some(_guard) = self.region.mutex.lock_timeout(TAKEOVER_MUTEX_TIMEOUT) else {
            return false;
        };
        apply_takeover_request(self.header())
    }

    /// Leave takeover; commits to `Direct` at the next frame boundary.
    /// No-op in `Direct`. Returns whether a release was initiated.
    pub fn release_takeover(&self) -> bool {
        let Some(_guard) = self.region.mutex.lock_timeout(TAKEOVER_MUTEX_TIMEOUT) else {
            return false;
        };
        let released = apply_takeover_release(self.header());
        drop(_guard);
        if released {
            tracing::debug!("takeover release requested");
        }
        released
    }
}

impl Drop for AudioBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn apply_panic_request(header: &BusHeader) {
    let _ = header
        .flags
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
            Some((f | FLAG_PANIC_REQUEST) & !FLAG_PANIC_ACK)
        });
}

pub(crate) fn apply_takeover_request(header: &BusHeader) -> bool {
    match header.state() {
        TakeoverState::Direct => {
            header.flags.fetch_or(FLAG_AUDIO_ENABLED, Ordering::AcqRel);
            header.set_state(TakeoverState::Pending);
            true
        }
        TakeoverState::Pending | TakeoverState::Active => true,
        TakeoverState::Releasing => false,
    }
}

pub(crate) fn apply_takeover_release(header: &BusHeader) -> bool {
    match header.state() {
        TakeoverState::Pending | TakeoverState::Active => {
            header.set_state(TakeoverState::Releasing);
            true
        }
        TakeoverState::Direct | TakeoverState::Releasing => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FLAG_VST_ACTIVE;
    use crate::region::test_bus_name;

    fn test_bus(tag: &str) -> Arc<AudioBus> {
        AudioBus::create(BusConfig {
            name: test_bus_name(tag),
            ..BusConfig::default()
        })
        .expect("create bus")
    }

    #[test]
    fn test_create_stamps_header() {
        let bus = test_bus("create");
        let header = bus.header();
        assert_eq!(header.magic, BUS_MAGIC);
        assert_eq!(header.version, BUS_VERSION);
        assert_eq!(header.synth_pid, std::process::id());
        assert_eq!(header.num_channels, NUM_CHANNELS as u32);
        assert_eq!(header.state(), TakeoverState::Direct);
        assert_eq!(header.flags(), FLAG_ACTIVE);
        assert!(bus.is_connected());
    }

    #[test]
    fn test_shutdown_clears_active() {
        let bus = test_bus("shutdown");
        bus.request_takeover();
        bus.shutdown();
        assert!(!bus.is_connected());
        assert_eq!(bus.header().state(), TakeoverState::Direct);
        assert_eq!(bus.header().flags(), 0);
        // Idempotent.
        bus.shutdown();
    }

    #[test]
    fn test_panic_round_trip() {
        let bus = test_bus("panic");

        bus.request_panic();
        assert!(bus.check_panic_request());
        assert_eq!(bus.header().flags() & FLAG_PANIC_ACK, 0);

        bus.acknowledge_panic();
        let flags = bus.header().flags();
        assert_eq!(flags & FLAG_PANIC_REQUEST, 0);
        assert_ne!(flags & FLAG_PANIC_ACK, 0);

        assert!(bus.clear_panic_ack());
        let flags = bus.header().flags();
        assert_eq!(flags & (FLAG_PANIC_REQUEST | FLAG_PANIC_ACK), 0);
    }

    #[test]
    fn test_request_clears_stale_ack() {
        let bus = test_bus("panic2");
        bus.request_panic();
        bus.acknowledge_panic();
        // A new request while the old ack is still visible must clear it:
        // both bits set is a forbidden state.
        bus.request_panic();
        let flags = bus.header().flags();
        assert_ne!(flags & FLAG_PANIC_REQUEST, 0);
        assert_eq!(flags & FLAG_PANIC_ACK, 0);
    }

    #[test]
    fn test_takeover_idempotence() {
        let bus = test_bus("takeover");

        // Release in Direct is a no-op.
        assert!(!bus.release_takeover());
        assert_eq!(bus.header().state(), TakeoverState::Direct);

        assert!(bus.request_takeover());
        assert_eq!(bus.header().state(), TakeoverState::Pending);
        assert_ne!(bus.header().flags() & FLAG_AUDIO_ENABLED, 0);

        // Requesting again while pending changes nothing.
        assert!(bus.request_takeover());
        assert_eq!(bus.header().state(), TakeoverState::Pending);

        assert!(bus.release_takeover());
        assert_eq!(bus.header().state(), TakeoverState::Releasing);
        // Releasing again is a no-op, and a request during release is
        // refused.
        assert!(!bus.release_takeover());
        assert!(!bus.request_takeover());
    }

    #[test]
    fn test_voice_updates() {
        let bus = test_bus("voices");
        let mut voices = [0u32; NUM_CHANNELS];
        voices[0] = 12;
        voices[9] = 30;
        bus.set_all_voices(&voices);

        let header = bus.header();
        assert_eq!(header.total_voices.load(Ordering::Relaxed), 42);
        assert_eq!(header.channels[9].voices.load(Ordering::Relaxed), 30);

        bus.set_channel_voices(9, 7);
        assert_eq!(header.channels[9].voices.load(Ordering::Relaxed), 7);
        // Out of range: ignored.
        bus.set_channel_voices(99, 1);
    }

    #[test]
    fn test_stamps_and_format() {
        let bus = test_bus("stamps");
        bus.record_midi_event();
        bus.record_synth_complete();
        bus.record_audio_output();
        let header = bus.header();
        assert!(header.last_midi_event_ticks.load(Ordering::Relaxed) > 0);
        assert!(header.last_synth_complete_ticks.load(Ordering::Relaxed) > 0);
        assert!(header.last_audio_output_ticks.load(Ordering::Relaxed) > 0);

        bus.set_sample_rate(44_100);
        assert_eq!(header.sample_rate.load(Ordering::Relaxed), 44_100);

        bus.set_latency_info(5_333, 0, EngineKind::Asio);
        assert_eq!(header.output_latency_us.load(Ordering::Relaxed), 5_333);
        assert_eq!(
            header.current_engine.load(Ordering::Relaxed),
            EngineKind::Asio as u32
        );
    }

    #[test]
    fn test_foreign_flag_bits_survive_panic_ops() {
        let bus = test_bus("flagmix");
        bus.header().flags.fetch_or(FLAG_VST_ACTIVE, Ordering::AcqRel);
        bus.request_panic();
        bus.acknowledge_panic();
        bus.clear_panic_ack();
        assert_ne!(bus.header().flags() & FLAG_VST_ACTIVE, 0);
        assert_ne!(bus.header().flags() & FLAG_ACTIVE, 0);
    }
}
