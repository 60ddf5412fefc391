//! User-facing entities built from a session's sensor events.
//!
//! One entity per sensor stream, plus one for the device availability.
//! Units and classes come from a static table keyed by sensor name; a
//! sensor outside the table keeps whatever unit its reading carried.
//! Every entity carries the same device descriptor so a consumer can group
//! them under one device.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::events::{SensorEvent, SensorObserver};
use crate::models::{Availability, SensorReading, SensorValue, AVAILABILITY_SENSOR};
use crate::state::{new_state, Shared, StoreSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorProfile {
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: Option<&'static str>,
}

pub fn sensor_profile(name: &str) -> Option<SensorProfile> {
    let (unit, device_class, state_class) = match name {
        "pv_voltage" | "bat_voltage" => ("V", "voltage", Some("measurement")),
        "pv_current" | "bat_current" => ("A", "current", Some("measurement")),
        "charge_power" => ("W", "power", Some("measurement")),
        "today_kwh" | "total_kwh" => ("kWh", "energy", Some("total_increasing")),
        "temperature" => ("°C", "temperature", None),
        _ => return None,
    };
    Some(SensorProfile {
        unit,
        device_class,
        state_class,
    })
}

/// `bat_voltage` -> `Bat Voltage`
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut after_letter = false;
    for c in name.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if after_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            after_letter = true;
        } else {
            out.push(c);
            after_letter = false;
        }
    }
    out
}

pub const IDENTIFIER_DOMAIN: &str = "mppt_bridge";
pub const MANUFACTURER: &str = "SmartSolar";
pub const MODEL: &str = "MPPT Charger";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// `(domain, device_id)` pairs
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl DeviceInfo {
    pub fn new(device_id: &str, device_name: &str) -> Self {
        Self {
            identifiers: vec![(IDENTIFIER_DOMAIN.to_string(), device_id.to_string())],
            name: device_name.to_string(),
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorEntity {
    pub unique_id: String,
    pub friendly_name: String,
    pub sensor: String,
    pub unit: Option<String>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub state: Option<SensorValue>,
    pub available: bool,
    /// RFC 3339, wall clock
    pub last_changed: Option<String>,
    pub device: DeviceInfo,
}

/// Observer keeping the entity table of one device. Clones share the table,
/// so a clone can be attached while another one is read.
#[derive(Clone)]
pub struct EntityProjection {
    label: String,
    device_id: String,
    device: DeviceInfo,
    entities: Shared<HashMap<String, SensorEntity>>,
}

impl EntityProjection {
    pub fn new(device_id: &str, device_name: &str) -> Self {
        Self {
            label: format!("entities:{device_id}"),
            device_id: device_id.to_string(),
            device: DeviceInfo::new(device_id, device_name),
            entities: new_state(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn entity(&self, sensor: &str) -> Option<SensorEntity> {
        self.entities.lock().get(sensor).cloned()
    }

    /// Availability entity included, sorted by unique id.
    pub fn entities(&self) -> Vec<SensorEntity> {
        let mut all: Vec<_> = self.entities.lock().values().cloned().collect();
        all.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        all
    }

    fn new_entity(&self, sensor: &str, reading_unit: Option<&str>) -> SensorEntity {
        let profile = sensor_profile(sensor);
        let (unique_id, friendly_name) = if sensor == AVAILABILITY_SENSOR {
            (
                format!("{}_availability", self.device_id),
                format!("{} Availability", self.device.name),
            )
        } else {
            (
                format!("{}_{sensor}", self.device_id),
                format!("{} {}", self.device.name, title_case(sensor)),
            )
        };

        SensorEntity {
            unique_id,
            friendly_name,
            sensor: sensor.to_string(),
            unit: profile
                .map(|p| p.unit.to_string())
                .or_else(|| reading_unit.map(str::to_string)),
            device_class: profile.map(|p| p.device_class),
            state_class: profile.and_then(|p| p.state_class),
            state: None,
            available: true,
            last_changed: None,
            device: self.device.clone(),
        }
    }

    fn ensure(&self, entities: &mut HashMap<String, SensorEntity>, sensor: &str, unit: Option<&str>) {
        if !entities.contains_key(sensor) {
            let entity = self.new_entity(sensor, unit);
            info!(unique_id = %entity.unique_id, name = %entity.friendly_name, "entity added");
            entities.insert(sensor.to_string(), entity);
        }
    }

    fn set_state(&self, reading: &SensorReading) -> Result<()> {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("formatting entity timestamp")?;

        let mut entities = self.entities.lock();
        self.ensure(&mut entities, &reading.name, reading.unit.as_deref());
        if let Some(entity) = entities.get_mut(&reading.name) {
            if entity.state.as_ref() != Some(&reading.value) || !entity.available {
                entity.last_changed = Some(now);
            }
            entity.state = Some(reading.value.clone());
            entity.available = true;
            if entity.unit.is_none() {
                entity.unit = reading.unit.clone();
            }
        }
        Ok(())
    }

    fn mark_unavailable(&self, sensor: &str) {
        if let Some(entity) = self.entities.lock().get_mut(sensor) {
            if entity.available {
                debug!(unique_id = %entity.unique_id, "entity unavailable");
            }
            entity.available = false;
        }
    }
}

impl SensorObserver for EntityProjection {
    fn label(&self) -> &str {
        &self.label
    }

    fn sync(&mut self, snapshot: &StoreSnapshot) -> Result<()> {
        for reading in &snapshot.readings {
            self.set_state(reading)?;
        }
        let availability = SensorReading::availability(snapshot.availability);
        self.set_state(&availability)?;
        if snapshot.availability == Availability::Offline {
            for reading in &snapshot.readings {
                self.mark_unavailable(&reading.name);
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: &SensorEvent) -> Result<()> {
        match event {
            SensorEvent::Discovered { name, .. } => {
                let mut entities = self.entities.lock();
                self.ensure(&mut entities, name, None);
            }
            SensorEvent::Updated { reading, .. } => self.set_state(reading)?,
            SensorEvent::Unavailable { name, .. } => self.mark_unavailable(name),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updated(reading: SensorReading) -> SensorEvent {
        SensorEvent::Updated {
            session_id: "s1".into(),
            name: reading.name.clone(),
            reading,
        }
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("pv_voltage"), "Pv Voltage");
        assert_eq!(title_case("today_kwh"), "Today Kwh");
        assert_eq!(title_case("mode"), "Mode");
        assert_eq!(title_case("load_40a"), "Load 40A");
    }

    #[test]
    fn test_lookup_table() {
        let temp = sensor_profile("temperature").unwrap();
        assert_eq!(temp.unit, "°C");
        assert_eq!(temp.state_class, None);
        assert_eq!(sensor_profile("total_kwh").unwrap().state_class, Some("total_increasing"));
        assert_eq!(sensor_profile("charge_power").unwrap().device_class, "power");
        assert!(sensor_profile("mode").is_none());
    }

    #[test]
    fn test_entities_from_events() {
        let mut projection = EntityProjection::new("dev1", "MPPT SmartSolar");
        projection
            .on_event(&SensorEvent::Discovered {
                session_id: "s1".into(),
                name: "pv_voltage".into(),
            })
            .unwrap();
        projection
            .on_event(&updated(SensorReading::new("pv_voltage", 18.2)))
            .unwrap();
        let mut fan = SensorReading::new("fan_speed", 1200.0);
        fan.unit = Some("rpm".into());
        projection.on_event(&updated(fan)).unwrap();

        let pv = projection.entity("pv_voltage").unwrap();
        assert_eq!(pv.unique_id, "dev1_pv_voltage");
        assert_eq!(pv.friendly_name, "MPPT SmartSolar Pv Voltage");
        assert_eq!(pv.unit.as_deref(), Some("V"));
        assert_eq!(pv.device_class, Some("voltage"));
        assert_eq!(pv.state, Some(SensorValue::Number(18.2)));
        assert!(pv.last_changed.is_some());

        let fan = projection.entity("fan_speed").unwrap();
        assert_eq!(fan.unit.as_deref(), Some("rpm"));
        assert_eq!(fan.device_class, None);
    }

    #[test]
    fn test_unavailable_and_recovery() {
        let mut projection = EntityProjection::new("dev1", "MPPT");
        projection
            .on_event(&updated(SensorReading::new("bat_voltage", 13.0)))
            .unwrap();
        projection
            .on_event(&updated(SensorReading::availability(Availability::Offline)))
            .unwrap();
        projection
            .on_event(&SensorEvent::Unavailable {
                session_id: "s1".into(),
                name: "bat_voltage".into(),
            })
            .unwrap();

        let availability = projection.entity(AVAILABILITY_SENSOR).unwrap();
        assert_eq!(availability.unique_id, "dev1_availability");
        assert_eq!(availability.state, Some(SensorValue::Text("offline".into())));
        assert!(!projection.entity("bat_voltage").unwrap().available);

        projection
            .on_event(&updated(SensorReading::new("bat_voltage", 13.1)))
            .unwrap();
        assert!(projection.entity("bat_voltage").unwrap().available);
    }

    #[test]
    fn test_every_entity_carries_device_info() {
        let mut projection = EntityProjection::new("dev1", "Roof MPPT");
        projection
            .on_event(&updated(SensorReading::new("pv_voltage", 18.0)))
            .unwrap();
        projection
            .on_event(&updated(SensorReading::availability(Availability::Online)))
            .unwrap();

        let entities = projection.entities();
        assert_eq!(entities.len(), 2);
        for entity in entities {
            assert_eq!(entity.device.manufacturer, "SmartSolar");
            assert_eq!(entity.device.model, "MPPT Charger");
            assert_eq!(entity.device.name, "Roof MPPT");
            assert_eq!(
                entity.device.identifiers,
                vec![("mppt_bridge".to_string(), "dev1".to_string())]
            );
        }
    }

    #[test]
    fn test_sync_from_snapshot() {
        let mut projection = EntityProjection::new("dev1", "MPPT");
        let reader = projection.clone();
        projection
            .sync(&StoreSnapshot {
                readings: vec![
                    SensorReading::new("pv_voltage", 1.0),
                    SensorReading::new("mode", "float"),
                ],
                availability: Availability::Offline,
            })
            .unwrap();

        let ids: Vec<_> = reader.entities().into_iter().map(|e| e.unique_id).collect();
        assert_eq!(ids, vec!["dev1_availability", "dev1_mode", "dev1_pv_voltage"]);
        assert!(!reader.entity("mode").unwrap().available);
    }
}
