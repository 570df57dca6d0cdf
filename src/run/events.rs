//! Per-run progress stream.
//!
//! The orchestrator is the only writer. Every event is kept in an in-memory
//! history, so a subscriber that joins late (or lags behind the broadcast
//! buffer) still sees the full sequence exactly once, in order, ending with
//! `done`.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const LIVE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Evidence,
    Solving,
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Ok,
    Error,
}

/// A citation in the final result, resolved against the run's evidence
/// where the label matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub label: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Phase {
        phase: Phase,
    },
    Progress {
        percent: u8,
        step: String,
    },
    Candidate {
        index: u32,
        status: CandidateStatus,
    },
    Result {
        output: String,
        score: f64,
        citations: Vec<Citation>,
        degraded: bool,
    },
    Error {
        code: String,
        message: String,
    },
    Done,
}

impl RunEvent {
    pub fn progress(percent: u8, step: impl Into<String>) -> Self {
        Self::Progress {
            percent: percent.min(100),
            step: step.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

struct Shared {
    history: Mutex<Vec<RunEvent>>,
    tx: broadcast::Sender<(usize, RunEvent)>,
}

impl Shared {
    fn history_from(&self, seq: usize) -> Vec<RunEvent> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.get(seq..).map(<[RunEvent]>::to_vec).unwrap_or_default()
    }
}

/// Write side of a run's event stream.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            shared: Arc::new(Shared {
                history: Mutex::new(Vec::new()),
                tx,
            }),
        }
    }

    /// Append `event`. Anything emitted after `done` is dropped.
    pub fn emit(&self, event: RunEvent) {
        let mut history = self.shared.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.last().is_some_and(RunEvent::is_done) {
            tracing::warn!(?event, "event after done dropped");
            return;
        }
        let seq = history.len();
        history.push(event.clone());
        // No live receivers is fine; the history still has it.
        let _ = self.shared.tx.send((seq, event));
    }

    pub fn is_closed(&self) -> bool {
        let history = self.shared.history.lock().unwrap_or_else(|p| p.into_inner());
        history.last().is_some_and(RunEvent::is_done)
    }

    pub fn history(&self) -> Vec<RunEvent> {
        self.shared.history_from(0)
    }

    /// Subscribe from the first event. The snapshot and the live receiver
    /// are taken under the same lock, so nothing is missed or repeated.
    pub fn subscribe(&self) -> RunEventStream {
        let history = self.shared.history.lock().unwrap_or_else(|p| p.into_inner());
        let rx = self.shared.tx.subscribe();
        let backlog: VecDeque<RunEvent> = history.iter().cloned().collect();
        RunEventStream {
            next_seq: backlog.len(),
            backlog,
            rx,
            shared: Arc::clone(&self.shared),
            finished: false,
        }
    }
}

/// Read side: history first, then live events, until `done`.
pub struct RunEventStream {
    backlog: VecDeque<RunEvent>,
    next_seq: usize,
    rx: broadcast::Receiver<(usize, RunEvent)>,
    shared: Arc<Shared>,
    finished: bool,
}

impl RunEventStream {
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.backlog.pop_front() {
                self.finished = event.is_done();
                return Some(event);
            }
            match self.rx.recv().await {
                Ok((seq, event)) => {
                    if seq < self.next_seq {
                        continue;
                    }
                    self.next_seq = seq + 1;
                    self.finished = event.is_done();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged, replaying history");
                    self.refill();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.refill();
                    if self.backlog.is_empty() {
                        self.finished = true;
                    }
                }
            }
        }
    }

    fn refill(&mut self) {
        let missed = self.shared.history_from(self.next_seq);
        self.next_seq += missed.len();
        self.backlog.extend(missed);
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.next().await {
            out.push(event);
        }
        out
    }

    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send {
        futures::stream::unfold(self, |mut s| async move {
            let event = s.next().await?;
            Some((event, s))
        })
    }
}
