use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod audit;
mod config;
mod dbus_interface;
mod engine;
mod uploads;

use config::{BusKind, Config};
use dbus_interface::{AttestService, BUS_NAME, OBJECT_PATH};
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        bus = ?config.bus,
        "attestd starting"
    );

    // Models load before the bus name is claimed so a broken install never answers calls.
    let engine = Arc::new(Engine::load(&config).context("initializing engine")?);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttestService::new(engine))?
        .build()
        .await
        .with_context(|| format!("claiming {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "attestd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attestd shutting down");

    Ok(())
}
