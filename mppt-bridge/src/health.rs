use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: ConnectionStatus,
    pub mqtt_reconnects: u32,
    pub messages_received: u64,
    pub decode_failures: u64,
}

impl fmt::Display for SessionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mqtt {} (reconnects: {}), {} messages, {} decode failures, up {}s",
            self.mqtt_status,
            self.mqtt_reconnects,
            self.messages_received,
            self.decode_failures,
            self.uptime_seconds
        )
    }
}

/// Connection diagnostics for one session. Cheap to clone, shared between
/// the connector task and whoever reports on it.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    messages_received: Arc<AtomicU64>,
    decode_failures: Arc<AtomicU64>,
    mqtt_status: Arc<parking_lot::Mutex<ConnectionStatus>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
            decode_failures: Arc::new(AtomicU64::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new(ConnectionStatus::Connecting)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = ConnectionStatus::Connected;
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = ConnectionStatus::Disconnected;
    }

    pub fn mark_mqtt_failed(&self) {
        *self.mqtt_status.lock() = ConnectionStatus::Failed;
    }

    pub fn mark_stopped(&self) {
        *self.mqtt_status.lock() = ConnectionStatus::Stopped;
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = ConnectionStatus::Connecting;
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.mqtt_status.lock()
    }

    pub fn get_health(&self) -> SessionHealth {
        SessionHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
