//! picolink daemon.
//!
//! Loads the configuration document, waits for the network, and runs the
//! serial bridge until SIGINT or SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use picolink::bridge::Bridge;
use picolink::cipher::CipherLayer;
use picolink::config::Config;
use picolink::connection::{ConnectionManager, TcpConnector};
use picolink::error::Error;
use picolink::indicator::{ActivityIndicator, LedIndicator, NoIndicator};
use picolink::link::{self, NetworkLink, NetworkManagerLink, Preassociated};
use picolink::serial;
use picolink::tracing::{self, prelude::*};
use picolink::types::RetryPolicy;

#[derive(Debug, Parser)]
#[command(name = "picolinkd", version, about = "Serial-to-TCP gateway daemon")]
struct Args {
    /// Configuration document
    #[arg(short, long, env = "PICOLINK_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Serial device, overriding the configuration
    #[arg(short, long)]
    serial: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();
    let args = Args::parse();

    let mut config = Config::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(device) = args.serial {
        config.serial.device = device;
    }

    let running = CancellationToken::new();
    watch_signals(running.clone())?;

    match serve(config, running).await {
        Ok(()) | Err(Error::Cancelled) => {
            info!("Exiting.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            Err(e.into())
        }
    }
}

async fn serve(config: Config, running: CancellationToken) -> picolink::error::Result<()> {
    let security = config.security()?;
    let cipher = CipherLayer::from_security(&security);
    let connector = TcpConnector::from_security(&security)?;
    let serial = serial::open(&config.serial)?;

    let mut indicator: Box<dyn ActivityIndicator> = match &config.led {
        Some(name) => Box::new(LedIndicator::new(name)),
        None => Box::new(NoIndicator),
    };

    let credentials = config.credentials();
    let mut net: Box<dyn NetworkLink> = match (&config.network_interface, &credentials) {
        (Some(interface), _) => Box::new(NetworkManagerLink::new(interface.clone())),
        (None, Some(_)) => {
            warn!("WIFI_SSID set without NETWORK_INTERFACE; assuming the link is up");
            Box::new(Preassociated)
        }
        (None, None) => Box::new(Preassociated),
    };
    link::associate(
        net.as_mut(),
        credentials.as_ref(),
        &RetryPolicy::default(),
        indicator.as_mut(),
        &running,
    )
    .await?;

    let manager = ConnectionManager::new(connector, config.endpoint(), running.clone())
        .with_policy(config.connect_policy())
        .with_framing(config.framing)
        .with_recv_limit(config.recv_limit);
    info!(
        endpoint = %manager.endpoint(),
        retry = %config.connect_policy(),
        framing = %config.framing,
        "Started."
    );

    let bridge = Bridge::start(
        serial,
        manager,
        cipher,
        config.identity().clone(),
        indicator,
        running,
    )
    .await?
    .with_poll_interval(config.poll_interval());

    bridge.run().await
}

fn watch_signals(running: CancellationToken) -> Result<()> {
    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm =
        unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        trace!("Shutting down.");
        running.cancel();
    });
    Ok(())
}
