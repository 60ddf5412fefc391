/**
 * DEVICE STATE STORE - Latest reading per sensor for one device session
 *
 * ROLE:
 * Single source of truth read by the watchdog and by observers on attach.
 * Only the latest value per sensor is kept, never a history.
 *
 * HOW IT WORKS:
 * - `latest` : sensor name -> reading (availability pseudo-sensor included)
 * - `known`  : sensor names in first-seen order (pseudo-sensor excluded)
 * - `availability` + `last_message` : liveness inputs for the watchdog
 *
 * The store itself is not synchronized; sessions wrap it in `Shared<T>`
 * and do apply + fan-out inside a single lock.
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

use crate::models::{Availability, SensorReading, AVAILABILITY_SENSOR};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// What a batch changed, in the order observers must be told about it.
/// `updated` holds every applied reading as it was applied, so a name
/// repeated within one batch shows up with each of its values.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub updated: Vec<SensorReading>,
    pub discovered: Vec<String>,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
    }
}

/// Point-in-time copy handed to observers for their initial sync.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Known sensors in first-seen order
    pub readings: Vec<SensorReading>,
    pub availability: Availability,
}

#[derive(Debug)]
pub struct DeviceStore {
    latest: HashMap<String, SensorReading>,
    known: Vec<String>,
    availability: Availability,
    last_message: Instant,
}

impl DeviceStore {
    /// Starts online; the silence window counts from `created_at`.
    pub fn new(created_at: Instant) -> Self {
        let mut latest = HashMap::new();
        latest.insert(
            AVAILABILITY_SENSOR.to_string(),
            SensorReading::availability(Availability::Online),
        );
        Self {
            latest,
            known: Vec::new(),
            availability: Availability::Online,
            last_message: created_at,
        }
    }

    /// Upserts every reading. An empty batch changes nothing, not even
    /// the last message time.
    pub fn apply(&mut self, readings: Vec<SensorReading>, now: Instant) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for reading in readings {
            if reading.name == AVAILABILITY_SENSOR {
                warn!("dropping telemetry record using reserved name {AVAILABILITY_SENSOR}");
                continue;
            }

            let name = reading.name.clone();
            outcome.updated.push(reading.clone());
            if self.latest.insert(name.clone(), reading).is_none() {
                self.known.push(name.clone());
                outcome.discovered.push(name);
            }
        }

        if !outcome.is_empty() {
            self.last_message = now;
        }
        outcome
    }

    /// Returns the previous state.
    pub fn set_availability(&mut self, state: Availability) -> Availability {
        let previous = self.availability;
        self.availability = state;
        self.latest.insert(
            AVAILABILITY_SENSOR.to_string(),
            SensorReading::availability(state),
        );
        previous
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn last_message(&self) -> Instant {
        self.last_message
    }

    pub fn get(&self, name: &str) -> Option<&SensorReading> {
        self.latest.get(name)
    }

    pub fn known(&self) -> &[String] {
        &self.known
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            readings: self
                .known
                .iter()
                .filter_map(|name| self.latest.get(name).cloned())
                .collect(),
            availability: self.availability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorValue;
    use std::time::Duration;

    fn reading(name: &str, value: f64) -> SensorReading {
        SensorReading::new(name, value)
    }

    #[test]
    fn test_discovery_once_update_always() {
        let t0 = Instant::now();
        let mut store = DeviceStore::new(t0);

        let first = store.apply(vec![reading("pv_voltage", 12.1)], t0);
        assert_eq!(first.discovered, vec!["pv_voltage"]);
        assert_eq!(first.updated, vec![reading("pv_voltage", 12.1)]);

        let second = store.apply(vec![reading("pv_voltage", 12.4)], t0);
        assert!(second.discovered.is_empty());
        assert_eq!(second.updated, vec![reading("pv_voltage", 12.4)]);
        assert_eq!(store.get("pv_voltage").unwrap().value.as_f64(), Some(12.4));
    }

    #[test]
    fn test_repeated_name_in_batch_keeps_each_value() {
        let t0 = Instant::now();
        let mut store = DeviceStore::new(t0);
        let outcome = store.apply(vec![reading("pv_current", 1.0), reading("pv_current", 2.0)], t0);

        assert_eq!(outcome.discovered, vec!["pv_current"]);
        let values: Vec<_> = outcome.updated.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![SensorValue::Number(1.0), SensorValue::Number(2.0)]);
        assert_eq!(store.get("pv_current").unwrap().value, SensorValue::Number(2.0));
    }

    #[test]
    fn test_first_seen_order_is_kept() {
        let t0 = Instant::now();
        let mut store = DeviceStore::new(t0);
        store.apply(vec![reading("b", 1.0), reading("a", 2.0)], t0);
        store.apply(vec![reading("c", 3.0), reading("a", 4.0)], t0);

        assert_eq!(store.known(), ["b", "a", "c"]);
        let names: Vec<_> = store.snapshot().readings.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_empty_batch_keeps_last_message_time() {
        let t0 = Instant::now();
        let mut store = DeviceStore::new(t0);
        let outcome = store.apply(Vec::new(), t0 + Duration::from_secs(30));
        assert!(outcome.is_empty());
        assert_eq!(store.last_message(), t0);

        store.apply(vec![reading("x", 1.0)], t0 + Duration::from_secs(31));
        assert_eq!(store.last_message(), t0 + Duration::from_secs(31));
    }

    #[test]
    fn test_reserved_name_never_becomes_known() {
        let t0 = Instant::now();
        let mut store = DeviceStore::new(t0);
        let outcome = store.apply(vec![SensorReading::new(AVAILABILITY_SENSOR, "offline")], t0);

        assert!(outcome.is_empty());
        assert!(store.known().is_empty());
        assert_eq!(store.get(AVAILABILITY_SENSOR).unwrap().value.to_string(), "online");
    }

    #[test]
    fn test_set_availability_writes_pseudo_sensor() {
        let mut store = DeviceStore::new(Instant::now());
        assert_eq!(store.set_availability(Availability::Offline), Availability::Online);
        assert_eq!(store.availability(), Availability::Offline);
        assert_eq!(store.get(AVAILABILITY_SENSOR).unwrap().value.to_string(), "offline");
        assert!(store.snapshot().readings.is_empty());
    }
}
