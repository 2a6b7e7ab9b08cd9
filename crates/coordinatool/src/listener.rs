//! Per-connection plumbing: one reader task and one writer task per worker
//! socket, both just moving newline-delimited JSON in and out. Neither ever
//! touches coordinator state directly — they only feed and drain channels —
//! so all dispatch stays on the single task that owns the `Coordinator`.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use coordinator_engine::worker::WorkerId;

/// Sent from a connection's reader task to the dispatch loop.
pub enum ConnEvent {
    Line { worker: WorkerId, line: String },
    Closed { worker: WorkerId },
}

pub fn spawn_reader(worker: WorkerId, read_half: OwnedReadHalf, events_tx: mpsc::UnboundedSender<ConnEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events_tx.send(ConnEvent::Line { worker, line }).is_err() {
                        return;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = events_tx.send(ConnEvent::Closed { worker });
                    return;
                }
            }
        }
    });
}

pub fn spawn_writer(mut write_half: OwnedWriteHalf, mut outgoing_rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(mut line) = outgoing_rx.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                return;
            }
        }
    });
}
