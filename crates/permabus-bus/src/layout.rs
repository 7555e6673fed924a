//! Wire layout of the shared region.
//!
//! The header is read by another process and another build, so its layout
//! is bit-exact and version-gated: fields are manually ordered so that
//! every one is naturally aligned and `#[repr(C)]` introduces no padding,
//! and the `const` block below proves the size and every offset at compile
//! time. Bump [`BUS_VERSION`] for any change here.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ BusHeader (512 bytes)                        │
//! ├──────────────────────────────────────────────┤
//! │ Out area: 16 channels × (A, B) stereo buffers │
//! │   16 × 2 × 2048 frames × 2 × 4 B = 512 KiB   │
//! ├──────────────────────────────────────────────┤
//! │ In area: (A, B) stereo buffers = 32 KiB      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every mutable field is an atomic (floats travel as `AtomicU32` bit
//! patterns); the plain fields are written once by the creator before the
//! `Active` flag is published. Multi-field updates go through the bus
//! mutex; single-word fields never do.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use permabus_core::tunables::{BUFFER_SAMPLES, NUM_CHANNELS, SAMPLE_BYTES, STEREO};
use permabus_core::ChannelCount;

use crate::BusError;

/// Magic bytes at offset 0 of the region.
pub const BUS_MAGIC: [u8; 4] = *b"OMAB";

/// Protocol version; a host seeing a different value must refuse to attach.
pub const BUS_VERSION: u32 = 3;

/// Synth process is up and the header is live.
pub const FLAG_ACTIVE: u32 = 0x0001;
/// Host asks the synth to send all-notes-off.
pub const FLAG_PANIC_REQUEST: u32 = 0x0002;
/// Synth has handled the panic request.
pub const FLAG_PANIC_ACK: u32 = 0x0004;
/// Takeover is pending or engaged (audio exchange armed).
pub const FLAG_AUDIO_ENABLED: u32 = 0x0008;
/// Host-side effect chain is live (informational, host-written).
pub const FLAG_VST_ACTIVE: u32 = 0x0010;

/// Header bytes at the start of the region.
pub const HEADER_SIZE: usize = 512;

/// Interleaved f32 count of one exchange buffer (stereo frames × 2).
pub const SLOT_SAMPLES: usize = BUFFER_SAMPLES * STEREO;

/// Byte size of one exchange buffer.
pub const SLOT_BYTES: usize = SLOT_SAMPLES * SAMPLE_BYTES;

/// Synth → host area: per channel, buffers A then B, channel-major.
pub const OUT_REGION_SIZE: usize = NUM_CHANNELS * 2 * SLOT_BYTES;

/// Host → synth area: stereo buffers A then B.
pub const IN_REGION_SIZE: usize = 2 * SLOT_BYTES;

/// Total byte size of the shared region.
pub const REGION_SIZE: usize = HEADER_SIZE + OUT_REGION_SIZE + IN_REGION_SIZE;

pub(crate) const OUT_REGION_OFFSET: usize = HEADER_SIZE;
pub(crate) const IN_REGION_OFFSET: usize = HEADER_SIZE + OUT_REGION_SIZE;

/// Whether the synth plays its own mix or the host's processed return.
///
/// `Pending → Active` and `Releasing → Direct` are committed only by the
/// synth's frame-boundary handler; the other transitions are external
/// requests taken under the bus mutex.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverState {
    /// Synth outputs its own mix; taps are installed but idle.
    Direct = 0,
    /// Host asked to take over; commits at the next frame boundary.
    Pending = 1,
    /// Frames flow through the host each cycle.
    Active = 2,
    /// Leaving takeover; commits to `Direct` at the next frame boundary.
    Releasing = 3,
}

impl TakeoverState {
    /// Decode a header value; unknown values are treated as `Direct`.
    #[must_use]
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::Pending,
            2 => Self::Active,
            3 => Self::Releasing,
            _ => Self::Direct,
        }
    }
}

/// Per-channel metering block inside the header.
#[repr(C)]
pub struct ChannelSlot {
    /// Smoothed left peak, f32 bits in [0, 1]
    pub peak_l: AtomicU32,
    /// Smoothed right peak, f32 bits in [0, 1]
    pub peak_r: AtomicU32,
    /// Active voices on this channel
    pub voices: AtomicU32,
    /// Future use
    pub reserved: [u32; 2],
}

/// Typed view over the first [`HEADER_SIZE`] bytes of the region.
#[repr(C)]
pub struct BusHeader {
    /// `"OMAB"`
    pub magic: [u8; 4],
    /// [`BUS_VERSION`] of the creator
    pub version: u32,
    /// PID of the synth process (event names embed it)
    pub synth_pid: u32,
    /// Current sample rate in Hz
    pub sample_rate: AtomicU32,
    /// Stereo frames per exchange buffer (fixed at creation)
    pub buffer_samples: u32,
    /// Channel count (fixed, 16)
    pub num_channels: u32,
    /// `FLAG_*` bits
    pub flags: AtomicU32,
    /// [`TakeoverState`] value
    pub takeover_state: AtomicU32,
    /// Bumped once per frame-boundary invocation
    pub heartbeat: AtomicU64,
    /// Milliseconds since boot at the last header update
    pub last_update_ms: AtomicU64,
    /// Smoothed master left peak, f32 bits
    pub master_peak_l: AtomicU32,
    /// Smoothed master right peak, f32 bits
    pub master_peak_r: AtomicU32,
    /// Total active voices across all channels
    pub total_voices: AtomicU32,
    /// Rendering CPU percentage, f32 bits
    pub cpu_usage: AtomicU32,
    /// Ticks per second of the tick stamps below
    pub tick_frequency: AtomicU64,
    /// Tick stamp of the last MIDI event received
    pub last_midi_event_ticks: AtomicU64,
    /// Tick stamp of the last completed synthesis buffer
    pub last_synth_complete_ticks: AtomicU64,
    /// Tick stamp of the last write to the output device
    pub last_audio_output_ticks: AtomicU64,
    /// Tick stamp of the last out-buffer publication
    pub last_shmem_write_ticks: AtomicU64,
    /// Tick stamp of the last in-buffer consumption
    pub last_shmem_read_ticks: AtomicU64,
    /// Output buffer latency in microseconds
    pub output_latency_us: AtomicU32,
    /// ASIO input latency in microseconds (0 elsewhere)
    pub asio_input_latency_us: AtomicU32,
    /// Host's own processing latency in microseconds (host-written)
    pub permafrost_latency_us: AtomicU32,
    /// [`permabus_core::EngineKind`] value
    pub current_engine: AtomicU32,
    /// Out buffer the synth writes next (0 or 1)
    pub out_write_index: AtomicI32,
    /// Out buffer the host last read (informational)
    pub out_read_index: AtomicI32,
    /// In buffer the host writes next (0 or 1, host-written)
    pub in_write_index: AtomicI32,
    /// In buffer the synth last read (informational)
    pub in_read_index: AtomicI32,
    /// Frames published by the synth; only ever increases
    pub out_frame_counter: AtomicU64,
    /// Frames returned by the host; only ever increases
    pub in_frame_counter: AtomicU64,
    /// Valid interleaved f32 count of the current frame (≤ [`SLOT_SAMPLES`])
    pub current_frame_samples: AtomicU32,
    /// Per-channel meters
    pub channels: [ChannelSlot; NUM_CHANNELS],
    /// Forward compatibility
    pub reserved: [u8; 28],
}

// Layout proof: any change that moves a field past another process must
// show up here and force a BUS_VERSION bump.
const _: () = {
    use std::mem::{offset_of, size_of};

    assert!(size_of::<ChannelSlot>() == 20);
    assert!(size_of::<BusHeader>() == HEADER_SIZE);

    assert!(offset_of!(BusHeader, magic) == 0);
    assert!(offset_of!(BusHeader, version) == 4);
    assert!(offset_of!(BusHeader, synth_pid) == 8);
    assert!(offset_of!(BusHeader, sample_rate) == 12);
    assert!(offset_of!(BusHeader, buffer_samples) == 16);
    assert!(offset_of!(BusHeader, num_channels) == 20);
    assert!(offset_of!(BusHeader, flags) == 24);
    assert!(offset_of!(BusHeader, takeover_state) == 28);
    assert!(offset_of!(BusHeader, heartbeat) == 32);
    assert!(offset_of!(BusHeader, last_update_ms) == 40);
    assert!(offset_of!(BusHeader, master_peak_l) == 48);
    assert!(offset_of!(BusHeader, master_peak_r) == 52);
    assert!(offset_of!(BusHeader, total_voices) == 56);
    assert!(offset_of!(BusHeader, cpu_usage) == 60);
    assert!(offset_of!(BusHeader, tick_frequency) == 64);
    assert!(offset_of!(BusHeader, last_midi_event_ticks) == 72);
    assert!(offset_of!(BusHeader, last_synth_complete_ticks) == 80);
    assert!(offset_of!(BusHeader, last_audio_output_ticks) == 88);
    assert!(offset_of!(BusHeader, last_shmem_write_ticks) == 96);
    assert!(offset_of!(BusHeader, last_shmem_read_ticks) == 104);
    assert!(offset_of!(BusHeader, output_latency_us) == 112);
    assert!(offset_of!(BusHeader, asio_input_latency_us) == 116);
    assert!(offset_of!(BusHeader, permafrost_latency_us) == 120);
    assert!(offset_of!(BusHeader, current_engine) == 124);
    assert!(offset_of!(BusHeader, out_write_index) == 128);
    assert!(offset_of!(BusHeader, out_read_index) == 132);
    assert!(offset_of!(BusHeader, in_write_index) == 136);
    assert!(offset_of!(BusHeader, in_read_index) == 140);
    assert!(offset_of!(BusHeader, out_frame_counter) == 144);
    assert!(offset_of!(BusHeader, in_frame_counter) == 152);
    assert!(offset_of!(BusHeader, current_frame_samples) == 160);
    assert!(offset_of!(BusHeader, channels) == 164);
    assert!(offset_of!(BusHeader, reserved) == 484);
};

impl BusHeader {
    /// Current takeover state.
    pub fn state(&self) -> TakeoverState {
        TakeoverState::from_u32(self.takeover_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TakeoverState) {
        self.takeover_state.store(state as u32, Ordering::Release);
    }

    /// Snapshot of the flags word.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Per-channel meter block, or `None` for an out-of-range index.
    pub fn channel(&self, index: ChannelCount) -> Option<&ChannelSlot> {
        self.channels.get(index)
    }

    /// Check magic and version, the way an attaching host must.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.magic != BUS_MAGIC {
            return Err(BusError::BadMagic);
        }
        if self.version != BUS_VERSION {
            return Err(BusError::VersionMismatch {
                expected: BUS_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Load an f32 published as bits in an `AtomicU32`.
pub(crate) fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

/// Publish an f32 as bits in an `AtomicU32`.
pub(crate) fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_arithmetic() {
        assert_eq!(SLOT_BYTES, 16384);
        assert_eq!(OUT_REGION_SIZE, 512 * 1024);
        assert_eq!(IN_REGION_SIZE, 32 * 1024);
        assert_eq!(REGION_SIZE, HEADER_SIZE + OUT_REGION_SIZE + IN_REGION_SIZE);
    }

    #[test]
    fn test_state_conversion() {
        assert_eq!(TakeoverState::from_u32(0), TakeoverState::Direct);
        assert_eq!(TakeoverState::from_u32(1), TakeoverState::Pending);
        assert_eq!(TakeoverState::from_u32(2), TakeoverState::Active);
        assert_eq!(TakeoverState::from_u32(3), TakeoverState::Releasing);
        assert_eq!(TakeoverState::from_u32(77), TakeoverState::Direct);
    }

    #[test]
    fn test_flag_bits_disjoint() {
        let all = [
            FLAG_ACTIVE,
            FLAG_PANIC_REQUEST,
            FLAG_PANIC_ACK,
            FLAG_AUDIO_ENABLED,
            FLAG_VST_ACTIVE,
        ];
        let mut seen = 0u32;
        for bit in all {
            assert_eq!(bit.count_ones(), 1);
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
    }

    #[test]
    fn test_f32_bit_roundtrip() {
        let cell = AtomicU32::new(0);
        store_f32(&cell, 0.472);
        assert!((load_f32(&cell) - 0.472).abs() < f32::EPSILON);
    }
}
