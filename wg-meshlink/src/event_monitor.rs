// Engine state-event correlation

//! Engine state-event correlation
//!
//! The engine reports link state changes through a callback. [`EventSink`] is
//! the callback side: it decodes each envelope and hands it to the armed
//! listener, or drops it when nobody is listening. [`EventMonitor`] arms one
//! listener per connect attempt and reports whether the expected state showed
//! up before the deadline.
//!
//! The listener must be receiving before the triggering engine call is made,
//! otherwise a fast engine can report the state before anyone is looking.
//! [`EventMonitor::await_state`] therefore returns only after the listener
//! task has registered itself.

use crate::engine::{decode_event, EventRecord};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Events buffered for an armed listener between polls
const LISTENER_CAPACITY: usize = 16;

struct Registration {
    generation: u64,
    sender: mpsc::Sender<EventRecord>,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    current: Option<Registration>,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// Callback side of the event stream, handed to the engine
#[derive(Clone)]
pub struct EventSink {
    slot: SharedSlot,
}

impl EventSink {
    /// Deliver a raw event envelope from the engine
    pub fn deliver(&self, raw: &str) {
        log::debug!("Engine event: {}", raw);
        let Some(record) = decode_event(raw) else {
            log::debug!("Ignoring undecodable engine event");
            return;
        };
        self.deliver_record(record);
    }

    /// Deliver an already decoded record
    pub fn deliver_record(&self, record: EventRecord) {
        let Ok(slot) = self.slot.lock() else {
            return;
        };
        // drop if nobody is listening
        if let Some(registration) = &slot.current {
            let _ = registration.sender.try_send(record);
        }
    }
}

/// Correlates engine events with an expected outcome
pub struct EventMonitor {
    slot: SharedSlot,
}

impl Default for EventMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMonitor {
    /// Monitor with no listener armed
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Sink to register as the engine's event callback
    pub fn sink(&self) -> EventSink {
        EventSink {
            slot: self.slot.clone(),
        }
    }

    /// Whether a listener is currently registered
    pub fn is_listening(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.current.is_some())
            .unwrap_or(false)
    }

    /// Arm a listener for `expected_state` reported for `public_key`.
    ///
    /// Returns once the listener is receiving, so the caller can issue the
    /// triggering action right away. The returned handle yields `true` on the
    /// first matching event and `false` once `timeout` has elapsed.
    pub async fn await_state(
        &self,
        public_key: &str,
        expected_state: &str,
        timeout: Duration,
    ) -> PendingVerification {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let slot = self.slot.clone();
        let public_key = public_key.to_string();
        let expected_state = expected_state.to_string();
        // sleep clamps timeouts past the end of the clock to a far deadline
        let expiry = tokio::time::sleep(timeout);

        let task = tokio::spawn(async move {
            let (sender, mut receiver) = mpsc::channel(LISTENER_CAPACITY);
            let guard = ListenerGuard::register(&slot, sender);
            let _ = ready_tx.send(());

            tokio::pin!(expiry);
            let matched = loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(record) => {
                            if record.public_key == public_key && record.state == expected_state {
                                break true;
                            }
                        }
                        None => break false,
                    },
                    _ = &mut expiry => break false,
                }
            };
            drop(guard);
            let _ = outcome_tx.send(matched);
        });

        if ready_rx.await.is_err() {
            log::error!("Event listener exited before it was armed");
        }

        PendingVerification {
            outcome: outcome_rx,
            task,
        }
    }
}

/// Keeps the listener registered for as long as the listener task runs
struct ListenerGuard {
    slot: SharedSlot,
    generation: u64,
}

impl ListenerGuard {
    fn register(slot: &SharedSlot, sender: mpsc::Sender<EventRecord>) -> Self {
        let mut locked = match slot.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        let generation = locked.next_generation;
        locked.next_generation += 1;
        locked.current = Some(Registration { generation, sender });
        Self {
            slot: slot.clone(),
            generation,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let mut locked = match self.slot.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        // a newer listener may already own the slot
        if locked
            .current
            .as_ref()
            .is_some_and(|current| current.generation == self.generation)
        {
            locked.current = None;
        }
    }
}

/// Outcome of an armed listener
///
/// Dropping it before awaiting tears the listener down.
pub struct PendingVerification {
    outcome: oneshot::Receiver<bool>,
    task: JoinHandle<()>,
}

impl PendingVerification {
    /// Wait for the listener's verdict
    pub async fn outcome(mut self) -> bool {
        (&mut self.outcome).await.unwrap_or(false)
    }
}

impl Drop for PendingVerification {
    fn drop(&mut self) {
        self.task.abort();
    }
}
