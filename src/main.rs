mod agent;
mod commands;
mod config;
mod control;
mod reading_buffer;
mod relay;
mod scheduler;
mod sensors;
mod store;
mod supabase;
mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    agent::{Agent, Schedule},
    commands::mqtt::CommandBus,
    config::Config,
    control::ControlService,
    store::MachineStore,
    supabase::SupabaseClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent; env vars may be set externally)
    let _ = dotenvy::dotenv();

    // Initialise tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load config
    let config = Config::from_env()?;
    info!(
        device_id = %config.device_id,
        channels = config.relay_pins.len(),
        temperature_sensor = config.has_temperature_sensor(),
        power_kw = config.power_kw,
        "Starting vacuum agent"
    );

    let store: Arc<dyn MachineStore> = Arc::new(SupabaseClient::new(&config)?);

    // Relays are parked inactive as soon as the lines are opened. Opening may
    // sleep while sysfs exports settle, so keep it off the async worker.
    let relays = tokio::task::block_in_place(|| relay::open_bank(&config))?;
    let sensor = sensors::open(&config);

    let control = ControlService::new(
        config.device_id.clone(),
        config.power_kw,
        relays,
        sensor,
        store.clone(),
    )
    .into_shared();

    let mut agent = Agent::new(
        config.device_id.clone(),
        config.command_source,
        Schedule::from_config(&config),
        control.clone(),
        store.clone(),
    );
    agent.start().await?;

    let bus = config
        .mqtt
        .as_ref()
        .map(|mqtt| CommandBus::spawn(mqtt, &config.device_id, control, store));

    agent.run(shutdown_signal()).await;

    if let Some(bus) = bus {
        bus.stop().await;
    }
    agent.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
