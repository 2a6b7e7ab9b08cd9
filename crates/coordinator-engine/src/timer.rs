//! Timer Engine: one coalesced deadline covering every expiry the engine
//! cares about (worker disconnect grace, batch slot idle/max, report flush),
//! so the main `tokio::select!` loop needs exactly one timer arm instead of
//! one per subsystem.

use std::time::Instant;

/// A named reason a wakeup fired, so the caller knows which subsystem to
/// re-check without having to recompute every deadline from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    WorkerGrace,
    BatchSlot,
    ReportFlush,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    kind: TimerKind,
}

/// Tracks the single next deadline across all sources. Callers register (or
/// clear) their next wakeup by kind; [`TimerEngine::next_deadline`] reports
/// the earliest one for the event loop to sleep until.
#[derive(Default)]
pub struct TimerEngine {
    worker_grace: Option<Instant>,
    batch_slot: Option<Instant>,
    report_flush: Option<Instant>,
}

impl TimerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_worker_grace(&mut self, at: Option<Instant>) {
        self.worker_grace = merge_earliest(self.worker_grace, at);
    }

    pub fn replace_worker_grace(&mut self, at: Option<Instant>) {
        self.worker_grace = at;
    }

    pub fn set_batch_slot(&mut self, at: Option<Instant>) {
        self.batch_slot = at;
    }

    pub fn set_report_flush(&mut self, at: Option<Instant>) {
        self.report_flush = at;
    }

    /// The earliest pending deadline, if any, and which subsystem it belongs
    /// to. When deadlines tie, worker-grace wins arbitrarily (order doesn't
    /// matter: the event loop re-derives all expirable state on every fire
    /// and will pick up the others on the next iteration).
    pub fn next_deadline(&self) -> Option<(Instant, TimerKind)> {
        [
            self.worker_grace.map(|at| Deadline { at, kind: TimerKind::WorkerGrace }),
            self.batch_slot.map(|at| Deadline { at, kind: TimerKind::BatchSlot }),
            self.report_flush.map(|at| Deadline { at, kind: TimerKind::ReportFlush }),
        ]
        .into_iter()
        .flatten()
        .min_by_key(|d| d.at)
        .map(|d| (d.at, d.kind))
    }
}

fn merge_earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_earliest_across_all_sources() {
        let mut timer = TimerEngine::new();
        let now = Instant::now();
        timer.set_worker_grace(Some(now + Duration::from_secs(10)));
        timer.set_batch_slot(Some(now + Duration::from_secs(2)));
        timer.set_report_flush(Some(now + Duration::from_secs(30)));

        let (at, kind) = timer.next_deadline().unwrap();
        assert_eq!(at, now + Duration::from_secs(2));
        assert_eq!(kind, TimerKind::BatchSlot);
    }

    #[test]
    fn none_when_nothing_pending() {
        let timer = TimerEngine::new();
        assert!(timer.next_deadline().is_none());
    }
}
