//! Payload decoder for the charger's `dataStreams` envelope.
//!
//! ```json
//! {"dataStreams": [{"name": "pv_voltage", "value": 12.1, "unit": "V"}, ...]}
//! ```
//!
//! A whole message is rejected only when it is not valid JSON or not shaped
//! like an envelope. Individual bad records are skipped.

use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;
use crate::models::{SensorReading, SensorValue};

const DATA_STREAMS: &str = "dataStreams";

/// Decodes one raw MQTT payload. A JSON object without `dataStreams` is a
/// valid message carrying no readings.
pub fn decode(raw: &[u8]) -> Result<Vec<SensorReading>, DecodeError> {
    let payload: Value = serde_json::from_slice(raw)?;
    let envelope = payload.as_object().ok_or(DecodeError::NotAnObject)?;

    let streams = match envelope.get(DATA_STREAMS) {
        None => return Ok(Vec::new()),
        Some(Value::Array(streams)) => streams,
        Some(_) => return Err(DecodeError::StreamsNotAList),
    };

    let readings = streams
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let reading = decode_record(record);
            if reading.is_none() {
                debug!(index, %record, "skipping malformed dataStreams record");
            }
            reading
        })
        .collect();

    Ok(readings)
}

fn decode_record(record: &Value) -> Option<SensorReading> {
    let name = record.get("name")?.as_str()?;
    let value = match record.get("value")? {
        Value::Number(n) => SensorValue::Number(n.as_f64()?),
        Value::String(s) => SensorValue::Text(s.clone()),
        _ => return None,
    };
    let unit = record
        .get("unit")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(SensorReading {
        name: name.to_string(),
        value,
        unit,
        raw: record.clone(),
    })
}
