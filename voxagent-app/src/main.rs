//! voxagent terminal host.
//!
//! Loads settings, wires a `SessionController` to the cpal audio backend and
//! drives it from stdin. Inbound envelopes are printed; function calls are
//! answered through the handler's outbox.

mod commands;
mod handler;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};
use voxagent_core::{CpalBackend, SessionController};

use commands::{Command, Flow};
use handler::{AppHandler, CallLedger, Reply};
use settings::{default_settings_path, load_settings, save_settings};

const HELP: &str = "commands: /start [device], /stop, /toggle, /mute, /unmute, /devices, \
                    /status, /quit; any other line is sent to the agent";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxagent=info,voxagent_core=info".into()),
        )
        .init();

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    let mut app_settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &app_settings) {
            warn!(settings_path = ?settings_path, "could not write default settings: {e}");
        }
    }
    app_settings.apply_overrides(|key| std::env::var(key).ok());
    if app_settings.identity.is_empty() {
        anyhow::bail!(
            "no session identity configured; set VOXAGENT_IDENTITY or \"identity\" in {}",
            settings_path.display()
        );
    }
    info!(
        settings_path = ?settings_path,
        endpoint = %app_settings.endpoint,
        user = %app_settings.user,
        input_device = ?app_settings.preferred_input_device,
        "settings loaded"
    );

    let config = app_settings.session_config(chrono::Local::now());
    config
        .session_url()
        .context("invalid session configuration")?;

    // ── Controller ────────────────────────────────────────────────────────
    let mut backend = CpalBackend::new();
    if let Some(device) = &app_settings.preferred_output_device {
        backend = backend.with_output_device(device);
    }
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Reply>();
    let ledger = Arc::new(CallLedger::default());
    let handler = AppHandler::new(outbox_tx, Arc::clone(&ledger), app_settings.user.clone());
    let controller = Arc::new(
        SessionController::builder(config, backend, handler)
            .on_analyzer(|_| info!("playback started"))
            .build(),
    );

    // Function-call replies leave the receive loop through this task.
    let replier = Arc::clone(&controller);
    tokio::spawn(async move {
        while let Some(reply) = outbox_rx.recv().await {
            if let Err(e) = replier.complete_function(&reply.call_id, reply.output).await {
                warn!(call_id = %reply.call_id, "function completion not sent: {e}");
            }
        }
    });

    let mut status_rx = controller.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match event.detail {
                    Some(detail) => println!("[session] {:?}: {detail}", event.status),
                    None => println!("[session] {:?}", event.status),
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Console loop ──────────────────────────────────────────────────────
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            controller.stop().await?;
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        // Ctrl-C while a command runs (say, a /start stuck connecting) stops
        // the session alongside it and then exits.
        let mut running = std::pin::pin!(commands::execute(&controller, &ledger, command));
        let flow = tokio::select! {
            flow = &mut running => Some(flow),
            _ = tokio::signal::ctrl_c() => None,
        };
        let flow = match flow {
            Some(flow) => flow,
            None => {
                info!("interrupted, stopping session");
                let (_, stopped) = tokio::join!(running, controller.stop());
                stopped?;
                Flow::Quit
            }
        };
        if flow == Flow::Quit {
            break;
        }
    }

    info!("voxagent exiting");
    Ok(())
}
