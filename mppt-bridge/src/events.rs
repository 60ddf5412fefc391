/**
 * SENSOR EVENT BUS - Discovery and update fan-out for one device session
 *
 * ROLE:
 * Decouples the ingest path and the watchdog from whoever consumes sensor
 * changes. Publishers never know how many observers exist.
 *
 * HOW IT WORKS:
 * - One tokio broadcast channel per session, publishing is non-blocking
 * - Raw subscribers get a `broadcast::Receiver`
 * - `SensorObserver`s run on their own task, their errors stay there
 * - A late subscriber only sees new events; sessions pair `subscribe`
 *   with a store snapshot taken under the same lock
 * - An observer that lags behind the buffer is resubscribed and synced
 *   again from a fresh snapshot, so it never misses state
 */

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::models::SensorReading;
use crate::state::StoreSnapshot;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// First time `name` shows up in this session
    Discovered { session_id: String, name: String },
    /// New value, availability pseudo-sensor included
    Updated {
        session_id: String,
        name: String,
        reading: SensorReading,
    },
    /// Device went silent, the entity for `name` should show as unavailable
    Unavailable { session_id: String, name: String },
}

impl SensorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SensorEvent::Discovered { session_id, .. }
            | SensorEvent::Updated { session_id, .. }
            | SensorEvent::Unavailable { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SensorEvent::Discovered { name, .. }
            | SensorEvent::Updated { name, .. }
            | SensorEvent::Unavailable { name, .. } => name,
        }
    }
}

/// Consumer of a session's sensor events.
pub trait SensorObserver: Send + 'static {
    /// Used in logs when the observer fails.
    fn label(&self) -> &str;

    /// Called once on attach with the state the event stream starts from.
    fn sync(&mut self, _snapshot: &StoreSnapshot) -> Result<()> {
        Ok(())
    }

    fn on_event(&mut self, event: &SensorEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SensorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many receivers got the event. Zero subscribers is fine.
    pub fn publish(&self, event: SensorEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!(sensor = event.name(), "no subscriber for sensor event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.sender.subscribe()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps an attached observer running; `detach` stops it.
#[derive(Debug)]
pub struct ObserverHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn detach(&self) {
        self.cancel.cancel();
    }

    /// Waits for the observer task to drain and exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("observer task ended abnormally: {e}");
        }
    }
}

/// Hands out a fresh receiver together with the state it starts from. Both
/// must be taken atomically with respect to publishers.
pub type Resync = Box<dyn FnMut() -> (broadcast::Receiver<SensorEvent>, StoreSnapshot) + Send>;

/// Runs `observer` against an already synced receiver until `cancel` fires
/// or the bus is dropped. On lag the observer is synced again through
/// `resync` and continues on the new receiver.
pub fn spawn_observer<O: SensorObserver>(
    mut observer: O,
    mut receiver: broadcast::Receiver<SensorEvent>,
    mut resync: Resync,
    cancel: CancellationToken,
) -> ObserverHandle {
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = observer.on_event(&event) {
                            warn!(observer = observer.label(), sensor = event.name(), "observer failed: {e:#}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(observer = observer.label(), skipped, "observer lagging, resyncing from store");
                        let (fresh, snapshot) = resync();
                        receiver = fresh;
                        if let Err(e) = observer.sync(&snapshot) {
                            warn!(observer = observer.label(), "resync failed: {e:#}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(observer = observer.label(), "observer detached");
    });

    ObserverHandle { cancel, task }
}
