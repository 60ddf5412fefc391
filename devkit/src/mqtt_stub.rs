/*!
In-memory stand-in for a rumqttc `AsyncClient` + `EventLoop` pair.

The test scripts what the broker "sends" through the client handle
(`connack`, `simulate_incoming`, `fail_connection`...) and the event loop
yields exactly those `rumqttc::Event`s, in order, from `poll`. With nothing
scripted, `poll` waits like a quiet broker would.
*/

use anyhow::Result;
use rumqttc::{
    ConnAck, ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, Publish, QoS,
};
use serde_json::{json, Value};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Scripted = std::result::Result<Event, ConnectionError>;

/// Client half: records what the code under test asked for and scripts
/// what the broker answers.
#[derive(Clone)]
pub struct MockMqttClient {
    subscriptions: Arc<Mutex<Vec<String>>>,
    disconnects: Arc<AtomicUsize>,
    reject_subscriptions: Arc<AtomicBool>,
    polls: Arc<AtomicUsize>,
    script: mpsc::UnboundedSender<Scripted>,
}

/// Event-loop half, polled by the connector.
pub struct MockEventLoop {
    receiver: mpsc::UnboundedReceiver<Scripted>,
    polls: Arc<AtomicUsize>,
}

pub fn mock_connection() -> (MockMqttClient, MockEventLoop) {
    let (script, receiver) = mpsc::unbounded_channel();
    let polls = Arc::new(AtomicUsize::new(0));
    let client = MockMqttClient {
        subscriptions: Arc::new(Mutex::new(Vec::new())),
        disconnects: Arc::new(AtomicUsize::new(0)),
        reject_subscriptions: Arc::new(AtomicBool::new(false)),
        polls: polls.clone(),
        script,
    };
    let eventloop = MockEventLoop { receiver, polls };
    (client, eventloop)
}

impl MockMqttClient {
    fn push(&self, next: Scripted) {
        // the event loop may already be gone at teardown
        let _ = self.script.send(next);
    }

    /// Same contract as `AsyncClient::try_subscribe`, without the QoS.
    pub fn try_subscribe<S: Into<String>>(&self, topic: S) -> Result<()> {
        let topic = topic.into();
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            anyhow::bail!("[MOCK] subscription to {topic} rejected");
        }
        tracing::debug!("[MOCK] subscribed to {topic}");
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    /// Records the request and answers like a broker closing the socket.
    pub fn try_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.push(Ok(Event::Outgoing(Outgoing::Disconnect)));
        self.push(Err(ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "[MOCK] connection closed after disconnect",
        ))));
    }

    pub fn connack(&self) {
        self.push(Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )))));
    }

    pub fn refuse(&self, code: ConnectReturnCode) {
        self.push(Err(ConnectionError::ConnectionRefused(code)));
    }

    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V)
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let publish = Publish::new(topic, QoS::AtMostOnce, payload);
        self.push(Ok(Event::Incoming(Packet::Publish(publish))));
    }

    pub fn simulate_broker_disconnect(&self) {
        self.push(Ok(Event::Incoming(Packet::Disconnect)));
    }

    pub fn fail_connection(&self, reason: &str) {
        self.push(Err(ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            reason.to_string(),
        ))));
    }

    pub fn reject_subscriptions(&self) {
        self.reject_subscriptions.store(true, Ordering::SeqCst);
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// How many times the event loop was polled, seen from the broker side.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl MockEventLoop {
    pub async fn poll(&mut self) -> std::result::Result<Event, ConnectionError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.receiver.recv().await {
            Some(next) => next,
            None => Err(ConnectionError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "[MOCK] broker handle dropped",
            ))),
        }
    }
}

/// Builds `{"dataStreams": [...]}` payloads the way the charger sends them.
#[derive(Debug, Default, Clone)]
pub struct MpptMessageBuilder {
    streams: Vec<Value>,
}

impl MpptMessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.streams.push(json!({ "name": name, "value": value.into() }));
        self
    }

    pub fn stream_with_unit<V: Into<Value>>(mut self, name: &str, value: V, unit: &str) -> Self {
        self.streams
            .push(json!({ "name": name, "value": value.into(), "unit": unit }));
        self
    }

    /// Appends an arbitrary record, malformed ones included.
    pub fn raw_record(mut self, record: Value) -> Self {
        self.streams.push(record);
        self
    }

    pub fn build(&self) -> Value {
        json!({ "dataStreams": self.streams })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}
