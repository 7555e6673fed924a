//! Core types and protocol tunables shared across the permabus ecosystem.
//!
//! This crate provides the fundamental building blocks the bus, the host
//! tools and the simulator all depend on. It carries no platform code.

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (32-bit float end to end)
pub type Sample = f32;

/// Number of (or index into) the bus's MIDI channels
pub type ChannelCount = usize;

/// Protocol tunables.
///
/// These are wire-visible or behavioural constants; changing any of the
/// wire-visible ones requires a protocol version bump.
pub mod tunables {
    use std::time::Duration;

    /// MIDI channel count carried on the bus (fixed).
    pub const NUM_CHANNELS: usize = 16;

    /// Stereo frames per exchange buffer.
    pub const BUFFER_SAMPLES: usize = 2048;

    /// Bytes per sample (f32).
    pub const SAMPLE_BYTES: usize = 4;

    /// Interleaved channel count of every exchange buffer.
    pub const STEREO: usize = 2;

    /// Bound on mutex acquisition for takeover requests and shutdown.
    pub const TAKEOVER_MUTEX_TIMEOUT: Duration = Duration::from_millis(100);

    /// How stale the synth's last-update stamp may get before external
    /// watchdogs should consider it gone.
    pub const HEARTBEAT_WINDOW: Duration = Duration::from_millis(500);

    /// How long the synth waits for the host's processed frame before
    /// falling back to direct output.
    pub const FRAME_TIMEOUT: Duration = Duration::from_millis(50);

    /// Peak meter decay per update (fast attack, slow release).
    pub const METER_DECAY: f32 = 0.92;

    /// Maximum frames the host may fall behind before the synth releases.
    pub const MAX_FRAME_DRIFT: u64 = 3;
}

/// Audio engine identifier published in the bus header.
///
/// Informational only; the host uses it to label latency figures.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Plain WAV writer
    Wav = 0,
    /// DirectSound
    DirectSound = 1,
    /// ASIO
    Asio = 2,
    /// WASAPI
    Wasapi = 3,
    /// XAudio
    XAudio = 4,
}

impl EngineKind {
    /// Decode a header value; unknown values fall back to [`EngineKind::Wav`].
    #[must_use]
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::DirectSound,
            2 => Self::Asio,
            3 => Self::Wasapi,
            4 => Self::XAudio,
            _ => Self::Wav,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Wav => "WAV",
            Self::DirectSound => "DirectSound",
            Self::Asio => "ASIO",
            Self::Wasapi => "WASAPI",
            Self::XAudio => "XAudio",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_roundtrip() {
        for kind in [
            EngineKind::Wav,
            EngineKind::DirectSound,
            EngineKind::Asio,
            EngineKind::Wasapi,
            EngineKind::XAudio,
        ] {
            assert_eq!(EngineKind::from_u32(kind as u32), kind);
        }
        assert_eq!(EngineKind::from_u32(999), EngineKind::Wav);
    }

    #[test]
    fn test_tunables_sane() {
        assert_eq!(tunables::NUM_CHANNELS, 16);
        assert!(tunables::METER_DECAY > 0.0 && tunables::METER_DECAY < 1.0);
        assert!(tunables::FRAME_TIMEOUT < tunables::HEARTBEAT_WINDOW);
    }
}
