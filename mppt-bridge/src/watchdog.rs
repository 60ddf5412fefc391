use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::SensorEvent;
use crate::models::{Availability, SensorReading, AVAILABILITY_SENSOR};
use crate::session::SessionCore;

/// Result of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    /// Silence just crossed the threshold
    WentOffline,
    /// Still silent; the offline notifications were sent again
    StillOffline,
}

/// Periodic liveness check for one session. Recovery is not handled here:
/// the ingest path flips the device back online as soon as data arrives.
pub struct Watchdog {
    core: Arc<SessionCore>,
    threshold: Duration,
    period: Duration,
}

impl Watchdog {
    pub fn new(core: Arc<SessionCore>, threshold: Duration, period: Duration) -> Self {
        Self {
            core,
            threshold,
            period,
        }
    }

    /// Compares the silence at `now` with the threshold and fans out the
    /// offline state while it lasts. Runs entirely under the store lock.
    pub fn check(&self, now: Instant) -> Liveness {
        let core = &self.core;
        let mut store = core.store.lock();

        let silence = now.saturating_duration_since(store.last_message());
        if silence <= self.threshold {
            return Liveness::Online;
        }

        let previous = store.set_availability(Availability::Offline);
        core.bus.publish(SensorEvent::Updated {
            session_id: core.id.clone(),
            name: AVAILABILITY_SENSOR.to_string(),
            reading: SensorReading::availability(Availability::Offline),
        });
        for name in store.known() {
            core.bus.publish(SensorEvent::Unavailable {
                session_id: core.id.clone(),
                name: name.clone(),
            });
        }

        if previous == Availability::Online {
            info!(
                session = %core.id,
                silent_secs = silence.as_secs(),
                sensors = store.known().len(),
                "no telemetry within reset timeout, device offline"
            );
            Liveness::WentOffline
        } else {
            debug!(session = %core.id, silent_secs = silence.as_secs(), "device still offline");
            Liveness::StillOffline
        }
    }

    /// Ticks until `cancel` fires. The first tick happens one period after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(Instant::now());
                }
            }
        }
        debug!(session = %self.core.id, "watchdog stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
