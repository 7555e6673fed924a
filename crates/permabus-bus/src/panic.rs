//! Background panic poller.
//!
//! The synth cannot afford to watch the panic bit from its realtime
//! threads, so a small background thread polls it on a fixed cadence.
//! When a request appears the poller runs the synth's all-notes-off
//! pathway, acknowledges on the bus, and emits a [`PanicEvent`].
//!
//! Other control channels that can deliver a panic (an operator console,
//! a debug pipe) should funnel their handling into the same
//! [`crate::AudioBus::acknowledge_panic`] call so the bus's two-bit
//! protocol stays authoritative.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use permabus_comms::{PanicEvent, PanicSender};

use crate::bus::AudioBus;

/// Handle on the poller thread; stops and joins it on drop.
pub struct PanicPoller {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PanicPoller {
    /// Start polling `bus` every `interval`.
    ///
    /// `reset` is the synth's all-notes-off + controller-reset pathway;
    /// it runs on the poller thread, so it must be safe to call from
    /// outside the audio path.
    pub fn spawn<F>(
        bus: Arc<AudioBus>,
        interval: Duration,
        events: PanicSender,
        mut reset: F,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                // Stop requested or the poller handle is gone.
                _ => return,
            }
            if !bus.check_panic_request() {
                continue;
            }
            tracing::info!("panic request observed on the bus");
            reset();
            bus.acknowledge_panic();
            let _ = events.send(PanicEvent::Handled);
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the poller and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PanicPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::layout::{FLAG_PANIC_ACK, FLAG_PANIC_REQUEST};
    use crate::region::test_bus_name;
    use permabus_comms::panic_channel;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_poller_handles_request() {
        let bus = AudioBus::create(BusConfig {
            name: test_bus_name("poller"),
            ..BusConfig::default()
        })
        .expect("create bus");

        let resets = Arc::new(AtomicU32::new(0));
        let resets_in_poller = resets.clone();
        let (events_tx, events_rx) = panic_channel();
        let poller = PanicPoller::spawn(
            bus.clone(),
            Duration::from_millis(5),
            events_tx,
            move || {
                resets_in_poller.fetch_add(1, Ordering::Relaxed);
            },
        );

        bus.request_panic();
        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("panic handled");
        assert_eq!(event, PanicEvent::Handled);
        assert_eq!(resets.load(Ordering::Relaxed), 1);

        let flags = bus.header().flags();
        assert_eq!(flags & FLAG_PANIC_REQUEST, 0);
        assert_ne!(flags & FLAG_PANIC_ACK, 0);

        poller.stop();
    }

    #[test]
    fn test_poller_idle_without_request() {
        let bus = AudioBus::create(BusConfig {
            name: test_bus_name("pollidle"),
            ..BusConfig::default()
        })
        .expect("create bus");

        let (events_tx, events_rx) = panic_channel();
        let _poller = PanicPoller::spawn(bus, Duration::from_millis(5), events_tx, || {
            panic!("reset must not run without a request")
        });

        assert!(events_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
