/**
 * DEVICE SESSION - One configured charger, from connection to teardown
 *
 * ROLE:
 * Owns everything one device needs: the store, the event bus, the
 * connector task, the watchdog task, the attached observers and the
 * health tracker. Nothing is shared between sessions.
 *
 * HOW IT WORKS:
 * - `SessionCore` is the part the tasks share (behind an Arc)
 * - Ingest: decode outside the lock, then apply + fan-out inside it
 * - Observers attach with subscribe + snapshot taken under that same lock
 * - Shutdown: watchdog, then transport, then observers; every step is
 *   bounded and logs its own failure
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::decoder::decode;
use crate::events::{spawn_observer, EventBus, ObserverHandle, SensorEvent, SensorObserver};
use crate::health::{HealthTracker, SessionHealth};
use crate::models::{Availability, SensorReading, AVAILABILITY_SENSOR};
use crate::mqtt::{run_connector, BrokerLink, RumqttLink};
use crate::state::{new_state, DeviceStore, Shared, StoreSnapshot};
use crate::watchdog::Watchdog;

const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct SessionCore {
    pub(crate) id: String,
    pub(crate) store: Shared<DeviceStore>,
    pub(crate) bus: EventBus,
    pub(crate) health: HealthTracker,
}

impl SessionCore {
    pub fn new(id: impl Into<String>, created_at: Instant) -> Self {
        Self {
            id: id.into(),
            store: new_state(DeviceStore::new(created_at)),
            bus: EventBus::new(),
            health: HealthTracker::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_bus(id: impl Into<String>, created_at: Instant, bus: EventBus) -> Self {
        Self {
            bus,
            ..Self::new(id, created_at)
        }
    }

    pub fn ingest(&self, payload: &[u8]) {
        self.ingest_at(payload, Instant::now());
    }

    /// Decode, store, notify. A bad payload is counted and dropped.
    pub fn ingest_at(&self, payload: &[u8], now: Instant) {
        let readings = match decode(payload) {
            Ok(readings) => readings,
            Err(e) => {
                self.health.record_decode_failure();
                warn!(session = %self.id, bytes = payload.len(), "dropping payload: {e}");
                return;
            }
        };
        self.health.record_message();

        let mut store = self.store.lock();
        let outcome = store.apply(readings, now);
        if outcome.is_empty() {
            debug!(session = %self.id, "message carried no readings");
            return;
        }

        let previous = store.set_availability(Availability::Online);
        if previous == Availability::Offline {
            info!(session = %self.id, "telemetry resumed, device online");
        }

        for name in &outcome.discovered {
            debug!(session = %self.id, sensor = %name, "new sensor discovered");
            self.bus.publish(SensorEvent::Discovered {
                session_id: self.id.clone(),
                name: name.clone(),
            });
        }
        for reading in outcome.updated {
            self.bus.publish(SensorEvent::Updated {
                session_id: self.id.clone(),
                name: reading.name.clone(),
                reading,
            });
        }
        self.bus.publish(SensorEvent::Updated {
            session_id: self.id.clone(),
            name: AVAILABILITY_SENSOR.to_string(),
            reading: SensorReading::availability(Availability::Online),
        });
    }

    fn subscribe_with_snapshot(&self) -> (broadcast::Receiver<SensorEvent>, StoreSnapshot) {
        let store = self.store.lock();
        (self.bus.subscribe(), store.snapshot())
    }
}

pub struct DeviceSession {
    config: SessionConfig,
    core: Arc<SessionCore>,
    cancel: CancellationToken,
    connector: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    observers: Vec<ObserverHandle>,
}

impl DeviceSession {
    /// Builds the transport from `config` and starts the connector and the
    /// watchdog. Fails before any task is spawned if the transport cannot
    /// be built.
    pub fn start(config: SessionConfig) -> Result<Self> {
        let link = RumqttLink::connect(&config)?;
        Ok(Self::start_with_link(config, link))
    }

    pub fn start_with_link<L: BrokerLink>(config: SessionConfig, link: L) -> Self {
        let core = Arc::new(SessionCore::new(config.id.clone(), Instant::now()));
        let cancel = CancellationToken::new();

        let watchdog = Watchdog::new(core.clone(), config.reset_timeout, config.watchdog_period)
            .spawn(cancel.child_token());
        let connector = tokio::spawn(run_connector(
            link,
            config.broker_url(),
            config.topic(),
            core.clone(),
            config.reconnect,
            cancel.child_token(),
        ));

        info!(
            session = %config.id,
            url = %config.broker_url(),
            topic = %config.topic(),
            reset_timeout_secs = config.reset_timeout.as_secs(),
            "session started"
        );

        Self {
            config,
            core,
            cancel,
            connector: Some(connector),
            watchdog: Some(watchdog),
            observers: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Raw event stream from now on; pair with `snapshot` for past state.
    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.core.bus.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.core.store.lock().snapshot()
    }

    pub fn health(&self) -> SessionHealth {
        self.core.health.get_health()
    }

    /// Syncs `observer` from the current store and feeds it every later
    /// event. The returned handle can detach it early; session shutdown
    /// detaches it anyway.
    pub fn attach_observer<O: SensorObserver>(&mut self, mut observer: O) -> &ObserverHandle {
        let (receiver, snapshot) = self.core.subscribe_with_snapshot();
        if let Err(e) = observer.sync(&snapshot) {
            warn!(session = %self.core.id, observer = observer.label(), "initial sync failed: {e:#}");
        }
        let core = self.core.clone();
        let handle = spawn_observer(
            observer,
            receiver,
            Box::new(move || core.subscribe_with_snapshot()),
            self.cancel.child_token(),
        );
        self.observers.push(handle);
        &self.observers[self.observers.len() - 1]
    }

    pub async fn shutdown(mut self) -> SessionHealth {
        let session = self.core.id.clone();
        self.cancel.cancel();

        if let Some(watchdog) = self.watchdog.take() {
            stop_task(&session, "watchdog", watchdog).await;
        }
        if let Some(connector) = self.connector.take() {
            stop_task(&session, "connector", connector).await;
        }
        for observer in self.observers.drain(..) {
            observer.detach();
            if timeout(TASK_STOP_TIMEOUT, observer.join()).await.is_err() {
                warn!(session = %session, "observer did not stop in time");
            }
        }

        let health = self.core.health.get_health();
        info!(session = %session, "session stopped: {health}");
        health
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn stop_task(session: &str, what: &str, mut task: JoinHandle<()>) {
    match timeout(TASK_STOP_TIMEOUT, &mut task).await {
        Ok(Ok(())) => debug!(session, "{what} stopped"),
        Ok(Err(e)) => warn!(session, "{what} ended abnormally: {e}"),
        Err(_) => {
            warn!(session, "{what} did not stop in time, aborting");
            task.abort();
        }
    }
}
