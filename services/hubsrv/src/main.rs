//! Hub service (`hubsrv`)
//!
//! Loads the configuration, starts the bus engine and, when a listen
//! address is configured, the inbound Modbus responder.

use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use common::{cancel_on_shutdown, init_logging, LogOptions, ServiceArgs};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hubsrv::{server, HubConfig, Hub, Responder};

const SERVICE_NAME: &str = "hubsrv";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} failed: {:#}", SERVICE_NAME, e);
            eprintln!("{}: {:#}", SERVICE_NAME, e);
            ExitCode::FAILURE
        },
    }
}

async fn run() -> Result<()> {
    let args = ServiceArgs::parse();
    let config = HubConfig::load(args.config.as_deref()).context("Loading configuration")?;

    // Validation mode: validate and exit
    if args.validate {
        println!("Configuration is valid");
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let _log_guard = init_logging(&LogOptions {
        service_name: SERVICE_NAME.to_string(),
        level: args.effective_log_level(&config.logging.level),
        ansi: !args.no_color,
        directory: config.logging.directory.clone(),
        json: config.logging.json,
    })?;
    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let (mut hub, handle) = Hub::from_config(&config, args.simulate)?;
    hub.start_default_tasks(Instant::now())?;

    let shutdown = CancellationToken::new();
    cancel_on_shutdown(shutdown.clone());

    let responder = match config.responder.listen {
        Some(addr) => {
            let listener = server::bind(addr).await?;
            let responder = Responder::new(
                handle.clone(),
                config.responder.unit_id,
                config.downstream_timeout(),
            );
            Some(tokio::spawn(server::serve(
                listener,
                responder,
                shutdown.clone(),
            )))
        },
        None => {
            info!("Modbus responder disabled");
            None
        },
    };

    let engine = tokio::spawn(hub.run(shutdown.clone()));
    let result = engine.await;
    // Stop the responder with the engine
    shutdown.cancel();

    if let Some(responder) = responder {
        match responder.await {
            Ok(Err(e)) => error!("Modbus responder failed: {}", e),
            Err(e) => error!("Modbus responder task failed: {}", e),
            Ok(Ok(())) => {},
        }
    }

    match result {
        Ok(Ok(())) => {
            info!("{} stopped", SERVICE_NAME);
            Ok(())
        },
        Ok(Err(e)) => Err(e).context("Engine loop terminated"),
        Err(e) => Err(anyhow::anyhow!("Engine loop panicked: {}", e)),
    }
}
