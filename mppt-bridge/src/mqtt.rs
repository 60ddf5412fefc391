use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ReconnectPolicy, SessionConfig, TlsPolicy};
use crate::error::ConnectError;
use crate::session::SessionCore;
use crate::tls::insecure_client_config;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_DRAIN: Duration = Duration::from_secs(1);

/// What the connector needs from an MQTT client + event loop pair.
pub trait BrokerLink: Send + 'static {
    fn poll(&mut self) -> impl Future<Output = Result<Event, ConnectionError>> + Send;

    /// Must not wait on the event loop: it is called from the task polling it.
    fn subscribe(&self, topic: &str) -> Result<()>;

    fn disconnect(&self);
}

pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttLink {
    pub fn connect(config: &SessionConfig) -> Result<Self, ConnectError> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config)?, REQUEST_CAPACITY);
        Ok(Self { client, eventloop })
    }
}

impl BrokerLink for RumqttLink {
    fn poll(&mut self) -> impl Future<Output = Result<Event, ConnectionError>> + Send {
        self.eventloop.poll()
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("disconnect request not queued: {e}");
        }
    }
}

pub fn mqtt_options(config: &SessionConfig) -> Result<MqttOptions, ConnectError> {
    if config.host.contains("://") || config.host.contains('/') {
        return Err(ConnectError::Address(format!(
            "host '{}' must be a bare hostname",
            config.host
        )));
    }

    let mut options = MqttOptions::new(config.client_id(), config.broker_url(), config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    if let Some(credentials) = &config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    let transport = match config.tls {
        TlsPolicy::Disabled => Transport::Ws,
        TlsPolicy::Verify => Transport::wss_with_default_config(),
        TlsPolicy::NoVerify => {
            warn!(session = %config.id, "TLS certificate verification is disabled for {}", config.host);
            Transport::Wss(TlsConfiguration::Rustls(insecure_client_config()))
        }
    };
    options.set_transport(transport);

    Ok(options)
}

fn log_connect_guidance(session: &str, url: &str, error: &ConnectionError) {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            error!(session, "broker refused the connection ({code:?}), check username and password");
        }
        _ => {
            error!(session, %url, "cannot connect to broker: {error}");
            error!(
                session,
                "the broker must accept MQTT over WebSocket; check the websocket path and whether TLS is required on this port"
            );
        }
    }
}

/// Drives one broker connection until `cancel` fires or the connection is
/// given up. Every ConnAck (first connect and reconnects) resubscribes.
pub async fn run_connector<L: BrokerLink>(
    mut link: L,
    url: String,
    topic: String,
    core: Arc<SessionCore>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let session = core.id.clone();
    let mut connected_once = false;
    let mut attempts = 0u32;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = link.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected_once = true;
                attempts = 0;
                core.health.mark_mqtt_connected();
                match link.subscribe(&topic) {
                    Ok(()) => info!(session = %session, %topic, "connected, subscribed"),
                    Err(e) => error!(session = %session, %topic, "subscribe failed: {e:#}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == topic {
                    core.ingest(&publish.payload);
                } else {
                    debug!(session = %session, topic = %publish.topic, "ignoring publish on foreign topic");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!(session = %session, "broker closed the session");
                core.health.mark_mqtt_disconnected();
            }
            Ok(_) => {}
            Err(e) => {
                core.health.mark_mqtt_disconnected();
                if connected_once {
                    warn!(session = %session, "connection lost: {e}");
                } else {
                    log_connect_guidance(&session, &url, &e);
                }

                if !policy.enabled() {
                    core.health.mark_mqtt_failed();
                    return;
                }
                if attempts >= policy.max_attempts {
                    error!(session = %session, attempts, "giving up on broker connection");
                    core.health.mark_mqtt_failed();
                    return;
                }

                attempts += 1;
                core.health.increment_reconnects();
                let delay = policy.delay_for(attempts);
                info!(session = %session, attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    close_link(&mut link, &session).await;
    core.health.mark_stopped();
}

/// Sends DISCONNECT and polls until it is flushed or the drain window ends.
async fn close_link<L: BrokerLink>(link: &mut L, session: &str) {
    link.disconnect();
    let drained = tokio::time::timeout(DISCONNECT_DRAIN, async {
        loop {
            match link.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!(session, "disconnect not flushed within {DISCONNECT_DRAIN:?}");
    }
    debug!(session, "connector stopped");
}
