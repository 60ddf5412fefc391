/**
 * MPPT BRIDGE - Entry point
 *
 * ROLE: Loads the device sessions from configuration, starts one connector,
 * store and watchdog per charger, projects sensor entities, and tears
 * everything down on Ctrl-C.
 *
 * ARCHITECTURE: cloud MQTT over WebSocket -> decoder -> per-device store ->
 * event bus -> observers, with a liveness watchdog on the side.
 */

mod config;
mod decoder;
mod error;
mod events;
mod health;
mod models;
mod mqtt;
mod projection;
mod session;
mod state;
mod tls;
mod watchdog;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::events::SensorEvent;
use crate::projection::EntityProjection;
use crate::session::DeviceSession;

const HEALTH_LOG_PERIOD: Duration = Duration::from_secs(300);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mppt_bridge=info")),
        )
        .with_target(false)
        .init();
}

fn log_health(sessions: &[(DeviceSession, EntityProjection)]) {
    for (session, projection) in sessions {
        let snapshot = session.snapshot();
        let entities = projection.entities();
        info!(
            session = session.id(),
            device = %snapshot.availability,
            sensors = snapshot.readings.len(),
            entities = entities.len(),
            available = entities.iter().filter(|e| e.available).count(),
            "health: {}",
            session.health()
        );
    }
}

/// Raw event trace, visible with `RUST_LOG=mppt_bridge=debug`.
fn spawn_event_log(mut events: broadcast::Receiver<SensorEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(session = event.session_id(), sensor = event.name(), "{event:?}"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event trace lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let configs = load_config().await.context("loading configuration")?;
    info!("starting {} device session(s)", configs.len());

    let mut sessions = Vec::with_capacity(configs.len());
    for config in configs {
        let id = config.id.clone();
        let mut session = match DeviceSession::start(config) {
            Ok(session) => session,
            Err(e) => {
                error!(session = %id, "cannot start session: {e:#}");
                for (session, _) in sessions {
                    DeviceSession::shutdown(session).await;
                }
                return Err(e.context(format!("starting session {id}")));
            }
        };
        let projection = EntityProjection::new(
            &session.config().device_id,
            &session.config().device_name,
        );
        session.attach_observer(projection.clone());
        spawn_event_log(session.subscribe());
        sessions.push((session, projection));
    }

    let mut ticker = interval(HEALTH_LOG_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_health(&sessions),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("cannot listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    info!("shutting down");
    log_health(&sessions);
    for (session, _) in sessions {
        session.shutdown().await;
    }
    Ok(())
}
