//! Shared-memory audio bus between a realtime MIDI synth and an
//! out-of-process effects host.
//!
//! The synth creates a named region holding a typed header (meters, voice
//! counts, timestamps, takeover state, heartbeat), a double-buffered
//! 16-channel *out* audio area and a double-buffered stereo *in* area. The
//! host attaches to the same names, observes the meters, and may take over
//! the mix: each frame the synth swaps its out buffer, signals `AudioReady`,
//! waits a bounded time for `ProcessedReady`, and plays the host's stereo
//! return instead of its own mixdown. Every failure path falls back to
//! direct output within one frame.
//!
//! # Thread model
//!
//! - [`AudioBus`] is the synth-side owner, shared via `Arc`; its methods are
//!   management/MIDI-thread safe and never touch the realtime constraints.
//! - [`FrameDriver`] belongs to the audio callback and runs the
//!   frame-boundary protocol; it never blocks beyond the frame timeout,
//!   never allocates, and reports incidents as
//!   [`permabus_comms::BusNotice`] values instead of logging.
//! - [`CaptureTap`]s are per-channel hooks the synthesis engine feeds with
//!   interleaved stereo chunks; they are lock-free.
//! - [`HostBus`] is the other process's view: attach, observe, take over,
//!   consume frames, return the mix.

use std::io;

pub mod clock;

mod bus;
mod host;
mod layout;
mod meters;
mod panic;
mod region;
mod transport;

pub use bus::{AudioBus, BusConfig};
pub use host::{BusSnapshot, ChannelLevels, HostBus};
pub use layout::{
    BusHeader, ChannelSlot, TakeoverState, BUS_MAGIC, BUS_VERSION, FLAG_ACTIVE, FLAG_AUDIO_ENABLED,
    FLAG_PANIC_ACK, FLAG_PANIC_REQUEST, FLAG_VST_ACTIVE, HEADER_SIZE, IN_REGION_SIZE,
    OUT_REGION_SIZE, REGION_SIZE, SLOT_SAMPLES,
};
pub use meters::PeakSmoother;
pub use panic::PanicPoller;
pub use region::DEFAULT_BUS_NAME;
pub use transport::{CaptureTap, FrameDriver};

/// Errors raised while setting up or attaching to the bus.
///
/// Once a bus is up, nothing in the frame path raises these: realtime
/// operations degrade to safe no-ops instead.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Creating or opening the shared-memory object failed.
    #[error("shared memory unavailable: {0}")]
    Mapping(#[source] io::Error),

    /// Mapping the region into the address space failed.
    #[error("mapping the region view failed: {0}")]
    View(#[source] io::Error),

    /// Creating or opening the bus mutex failed.
    #[error("bus mutex unavailable: {0}")]
    Mutex(#[source] io::Error),

    /// Creating or opening a frame event failed.
    #[error("frame event unavailable: {0}")]
    Event(#[source] io::Error),

    /// A region, mutex or event name contained an interior NUL.
    #[error("object name contains an interior NUL byte")]
    InvalidName,

    /// The mapped region does not start with the bus magic.
    #[error("region header magic mismatch (not an audio bus?)")]
    BadMagic,

    /// The peer speaks a different protocol version; refuse to attach.
    #[error("protocol version mismatch: peer has {found}, this build expects {expected}")]
    VersionMismatch {
        /// Version this build was compiled against
        expected: u32,
        /// Version found in the mapped header
        found: u32,
    },
}
