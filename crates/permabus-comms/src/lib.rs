//! Lockless communication primitives for audio-thread-safe reporting.
//!
//! The bus's frame handler runs inside the audio callback and must never
//! block, allocate, or log. Anything it wants the rest of the process to
//! know about travels as a [`BusNotice`] through a lock-free ring and gets
//! logged by whichever thread drains it.

pub use rtrb;

use crossbeam_channel::{Receiver, Sender};

/// Why the synth dropped out of takeover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The host did not return a processed frame within the frame timeout.
    HostTimeout,
    /// The host fell more frames behind than the drift threshold allows.
    FrameDrift {
        /// Frames the synth has published
        out_frames: u64,
        /// Frames the host has returned
        in_frames: u64,
    },
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostTimeout => f.write_str("host frame timeout"),
            Self::FrameDrift {
                out_frames,
                in_frames,
            } => write!(f, "host drifted ({out_frames} out vs {in_frames} in)"),
        }
    }
}

/// Incidents the realtime frame handler reports to the management thread.
///
/// IMPORTANT: all variants must be `Copy`; they cross an `rtrb` ring from
/// the audio callback, which cannot run destructors or allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusNotice {
    /// A pending takeover was committed at a frame boundary.
    TakeoverEngaged,
    /// Takeover ended; the synth is back on (or heading to) direct output.
    TakeoverReleased(ReleaseReason),
}

/// Notice producer (audio thread side)
pub type NoticeSender = rtrb::Producer<BusNotice>;
/// Notice consumer (management thread side)
pub type NoticeReceiver = rtrb::Consumer<BusNotice>;

/// Create the notice ring. A small capacity is plenty: notices are rare
/// and a dropped notice only costs a log line.
#[must_use]
pub fn notice_channel(capacity: usize) -> (NoticeSender, NoticeReceiver) {
    rtrb::RingBuffer::new(capacity)
}

/// Events emitted by the panic poller once a panic has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicEvent {
    /// The reset pathway ran and the request was acknowledged on the bus.
    Handled,
}

/// Panic event producer (poller thread)
pub type PanicSender = Sender<PanicEvent>;
/// Panic event consumer (application)
pub type PanicReceiver = Receiver<PanicEvent>;

/// Create the panic event channel (unbounded; panics are rare and the
/// sender must never block).
#[must_use]
pub fn panic_channel() -> (PanicSender, PanicReceiver) {
    crossbeam_channel::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_ring() {
        let (mut tx, mut rx) = notice_channel(4);
        assert!(tx.push(BusNotice::TakeoverEngaged).is_ok());
        assert!(tx
            .push(BusNotice::TakeoverReleased(ReleaseReason::HostTimeout))
            .is_ok());
        assert_eq!(rx.pop().ok(), Some(BusNotice::TakeoverEngaged));
        assert_eq!(
            rx.pop().ok(),
            Some(BusNotice::TakeoverReleased(ReleaseReason::HostTimeout))
        );
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_notice_ring_full_drops() {
        let (mut tx, _rx) = notice_channel(1);
        assert!(tx.push(BusNotice::TakeoverEngaged).is_ok());
        // Second push fails instead of blocking; callers discard the result.
        assert!(tx.push(BusNotice::TakeoverEngaged).is_err());
    }

    #[test]
    fn test_panic_channel() {
        let (tx, rx) = panic_channel();
        tx.send(PanicEvent::Handled).unwrap();
        assert_eq!(rx.recv().unwrap(), PanicEvent::Handled);
    }

    #[test]
    fn test_release_reason_display() {
        let reason = ReleaseReason::FrameDrift {
            out_frames: 9,
            in_frames: 5,
        };
        assert_eq!(reason.to_string(), "host drifted (9 out vs 5 in)");
    }
}
