//! RTSP transport fallback ladder.
//!
//! Video sources reading RTSP attempt transports in the order
//! `[configured, tcp, udp, http]` (deduplicated). After a configurable number
//! of failures on one rung the ladder advances and a transport-fallback event
//! is emitted; exhausting the ladder opens the circuit breaker.

use guardian_model::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderOutcome {
    /// Stay on the current rung.
    Stay,
    /// Advanced to the next rung.
    Advanced {
        from: TransportKind,
        to: TransportKind,
    },
    /// Every rung failed its budget.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct TransportLadder {
    rungs: Vec<TransportKind>,
    index: usize,
    failures_on_rung: u32,
    threshold: u32,
    advances: u32,
}

impl TransportLadder {
    pub fn new(configured: Option<TransportKind>, threshold: u32) -> Self {
        let mut rungs = Vec::with_capacity(4);
        for candidate in [
            configured,
            Some(TransportKind::Tcp),
            Some(TransportKind::Udp),
            Some(TransportKind::Http),
        ]
        .into_iter()
        .flatten()
        {
            if !rungs.contains(&candidate) {
                rungs.push(candidate);
            }
        }
        Self {
            rungs,
            index: 0,
            failures_on_rung: 0,
            threshold: threshold.max(1),
            advances: 0,
        }
    }

    pub fn current(&self) -> TransportKind {
        self.rungs[self.index.min(self.rungs.len() - 1)]
    }

    /// Total rung advances since the last reset.
    pub fn advances(&self) -> u32 {
        self.advances
    }

    pub fn record_success(&mut self) {
        self.failures_on_rung = 0;
    }

    pub fn record_failure(&mut self) -> LadderOutcome {
        self.failures_on_rung += 1;
        if self.failures_on_rung < self.threshold {
            return LadderOutcome::Stay;
        }
        if self.index + 1 >= self.rungs.len() {
            return LadderOutcome::Exhausted;
        }
        let from = self.rungs[self.index];
        self.index += 1;
        self.failures_on_rung = 0;
        self.advances += 1;
        LadderOutcome::Advanced {
            from,
            to: self.rungs[self.index],
        }
    }

    /// Re-arm at the head of the ladder. Returns whether anything changed.
    pub fn reset(&mut self) -> bool {
        let changed = self.index != 0 || self.failures_on_rung != 0;
        self.index = 0;
        self.failures_on_rung = 0;
        self.advances = 0;
        changed
    }
}
