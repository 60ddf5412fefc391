/*!
# MPPT DevKit - Test tooling for the bridge

- In-memory MQTT client/event-loop pair, scripted from the test
- Builders for charger telemetry payloads
- Channel helpers for asserting on fan-out events
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{mock_connection, MockEventLoop, MockMqttClient, MpptMessageBuilder};
