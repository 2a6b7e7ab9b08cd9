//! Reporting: an append-only, human-readable line log of action lifecycle
//! events, written to one file per hint tag under `reporting_dir`. This is
//! a diagnostics side-channel, not a recovery source — [`crate::recovery`]
//! reads the state directory, not these files.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use coordinator_protocol::ActionKey;

/// One buffered append-only writer per hint tag.
#[derive(Default)]
pub struct ReportingSink {
    dir: Option<PathBuf>,
    writers: HashMap<String, std::io::BufWriter<std::fs::File>>,
}

/// The stage an action has reached, as recorded in a report line.
#[derive(Debug, Clone, Copy)]
pub enum ReportEvent {
    New,
    Assigned,
    Sent,
    Progress { bytes_done: u64 },
    Done { status: i32 },
}

impl ReportEvent {
    fn tag(&self) -> &'static str {
        match self {
            ReportEvent::New => "new",
            ReportEvent::Assigned => "assigned",
            ReportEvent::Sent => "sent",
            ReportEvent::Progress { .. } => "progress",
            ReportEvent::Done { .. } => "done",
        }
    }
}

impl ReportingSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            writers: HashMap::new(),
        }
    }

    fn writer_for(&mut self, hint: &str) -> std::io::Result<Option<&mut std::io::BufWriter<std::fs::File>>> {
        let Some(dir) = &self.dir else { return Ok(None) };
        if !self.writers.contains_key(hint) {
            std::fs::create_dir_all(dir)?;
            let path: &Path = dir;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.join(format!("{hint}.log")))?;
            self.writers.insert(hint.to_string(), std::io::BufWriter::new(file));
        }
        Ok(self.writers.get_mut(hint))
    }

    /// Append one line for `key` under `hint`. Write failures are logged and
    /// swallowed: reporting is diagnostics, never a path that should fail a
    /// request.
    pub fn record(&mut self, hint: &str, key: &ActionKey, event: ReportEvent) {
        let line = match event {
            ReportEvent::Progress { bytes_done } => {
                format!("{key} {} bytes_done={bytes_done}\n", event.tag())
            }
            ReportEvent::Done { status } => {
                format!("{key} {} status={status}\n", event.tag())
            }
            _ => format!("{key} {}\n", event.tag()),
        };

        match self.writer_for(hint) {
            Ok(Some(writer)) => {
                if let Err(err) = writer.write_all(line.as_bytes()) {
                    tracing::warn!(hint, error = %err, "reporting write failed");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(hint, error = %err, "reporting sink unavailable"),
        }
    }

    /// Flush every open writer. Called from the Timer Engine's report-flush
    /// branch on a fixed cadence rather than after every single write.
    pub fn flush_all(&mut self) {
        for (hint, writer) in self.writers.iter_mut() {
            if let Err(err) = writer.flush() {
                tracing::warn!(hint, error = %err, "reporting flush failed");
            }
        }
    }
}
