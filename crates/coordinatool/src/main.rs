mod cli;
mod listener;
mod logging;
mod shutdown;
mod uplink;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use coordinator_engine::hostmap::NullLocator;
use coordinator_engine::mirror::{NullMirror, PersistenceMirror, RedisMirror};
use coordinator_engine::worker::WorkerId;
use coordinator_engine::{recovery, Coordinator};
use coordinator_protocol::wire::{HsmActionList, Reply, Request};
use coordinator_protocol::ProtocolError;

use crate::cli::Cli;
use crate::listener::{spawn_reader, spawn_writer, ConnEvent};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Build the Persistence Mirror from config. A connection failure is
/// advisory per the error-handling design: log a warning and fall back to
/// `NullMirror` rather than fail startup over a read side-channel.
async fn build_mirror(config: &coordinator_protocol::CoordinatorConfig) -> Box<dyn PersistenceMirror> {
    match RedisMirror::connect(&config.kv_store_host, config.kv_store_port).await {
        Ok(mirror) => Box::new(mirror),
        Err(err) => {
            tracing::warn!(
                host = %config.kv_store_host,
                port = config.kv_store_port,
                error = %err,
                "persistence mirror unreachable at startup, continuing without it"
            );
            Box::new(NullMirror)
        }
    }
}

fn reply_json(reply: &Reply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize reply");
        r#"{"command":"error","status":22,"error":"internal serialization failure"}"#.to_string()
    })
}

/// Push every reply the coordinator owes a worker out-of-band (woken by
/// someone else's enqueue or `DONE`, not by its own request) out over that
/// worker's own socket.
fn flush_out_of_band(coordinator: &mut Coordinator, writers: &HashMap<WorkerId, mpsc::UnboundedSender<String>>) {
    for (worker_id, reply) in coordinator.drain_out_of_band() {
        if let Some(tx) = writers.get(&worker_id) {
            let _ = tx.send(reply_json(&reply));
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbosity());

    let mut config = coordinator_protocol::config::load(None)?;
    cli.apply_overrides(&mut config);

    let state_dir: PathBuf = cli
        .mount
        .join(config.state_dir_prefix.clone().unwrap_or_else(|| "coordinatool".to_string()));
    std::fs::create_dir_all(&state_dir)?;

    let mirror = build_mirror(&config).await;
    let mut coordinator = Coordinator::new(config.clone(), mirror, Box::new(NullLocator), state_dir.clone());

    let recovered = recovery::scan_state_dir(&state_dir)?;
    let recovered_count = recovered.len();
    coordinator.recover_all(recovered);
    if recovered_count > 0 {
        tracing::info!(count = recovered_count, "recovered in-flight actions from state directory");
    }

    let listen_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "coordinator listening");

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ConnEvent>();
    let mut writers: HashMap<WorkerId, mpsc::UnboundedSender<String>> = HashMap::new();

    let (uplink_tx, mut uplink_rx) = mpsc::unbounded_channel::<HsmActionList>();
    let uplink_worker = coordinator.connect();
    tokio::spawn(uplink::run(uplink::uplink_path(&cli.mount), uplink_tx));

    let mut next_wake = coordinator.next_timer_deadline().map(|(at, _)| at);
    let mut draining = false;

    loop {
        let timer_sleep = async {
            match next_wake {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let worker_id = coordinator.connect();
                        let (read_half, write_half) = stream.into_split();
                        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<String>();
                        writers.insert(worker_id, outgoing_tx);
                        spawn_reader(worker_id, read_half, events_tx.clone());
                        spawn_writer(write_half, outgoing_rx);
                        tracing::debug!(%addr, worker = worker_id.0, "worker connected");
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }

            Some(event) = events_rx.recv() => {
                match event {
                    ConnEvent::Line { worker, line } => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Request>(&line) {
                            Ok(request) => {
                                let reply = coordinator.handle_request(worker, request);
                                if let Some(tx) = writers.get(&worker) {
                                    let _ = tx.send(reply_json(&reply));
                                }
                                flush_out_of_band(&mut coordinator, &writers);
                            }
                            Err(err) => {
                                let err = ProtocolError::from(err);
                                tracing::warn!(worker = worker.0, error = %err, "malformed request, ignoring");
                                if let Some(tx) = writers.get(&worker) {
                                    let body = serde_json::json!({
                                        "command": "error",
                                        "status": coordinator_protocol::wire::status::EINVAL,
                                        "error": err.to_string(),
                                    });
                                    let _ = tx.send(body.to_string());
                                }
                            }
                        }
                    }
                    ConnEvent::Closed { worker } => {
                        coordinator.disconnect(worker);
                        writers.remove(&worker);
                        tracing::debug!(worker = worker.0, "worker disconnected");
                    }
                }
            }

            Some(list) = uplink_rx.recv() => {
                let reply = coordinator.handle_request(
                    uplink_worker,
                    Request::Queue { fsname: list.hal_fsname.clone(), hsm_action_items: list.list },
                );
                if let coordinator_protocol::wire::Reply::Queue { status, error } = reply {
                    if status != coordinator_protocol::wire::status::OK {
                        tracing::warn!(status, error = ?error, "uplink enqueue rejected");
                    }
                }
                flush_out_of_band(&mut coordinator, &writers);
            }

            _ = timer_sleep => {
                coordinator.on_timer_fire(Instant::now());
                flush_out_of_band(&mut coordinator, &writers);
            }

            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("shutdown requested, waiting for in-flight actions to drain (press CTRL+C again to exit immediately)");
                        draining = true;
                    }
                    Some(ShutdownEvent::Immediate) | None => {
                        tracing::info!("exiting immediately");
                        break;
                    }
                }
            }
        }

        if draining && coordinator.is_idle() {
            break;
        }
        next_wake = coordinator.next_timer_deadline().map(|(at, _)| at);
    }

    Ok(())
}
