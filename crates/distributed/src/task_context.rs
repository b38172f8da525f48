//! Countdown-and-merge state for in-flight distributed tasks.
//!
//! Every context expects a fixed number of direct-child responses. Each
//! response decrements the countdown under the context lock; the single
//! terminal emission happens when it reaches zero or on the first error, and
//! sets `closed` so later responses are dropped. Emission never blocks: a
//! full or abandoned result queue just loses the value.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use tsq_common::{Result, TaskId, TsqError};
use tsq_execution::{
    BrokerNodeStats, GroupingAggregator, LeafNodeStats, QueryStats, decode_series, decode_stats,
};
use tsq_storage::TimeSeries;

use crate::rpc::{ResponseType, TaskResponse};

/// Where a context sits in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Root,
    Intermediate,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Root => "root",
            TaskKind::Intermediate => "intermediate",
        }
    }
}

/// Terminal value of a metric task context.
#[derive(Debug)]
pub struct TimeSeriesEvent {
    pub series: Vec<TimeSeries>,
    /// Present when the task runs in explain mode.
    pub stats: Option<QueryStats>,
    pub err: Option<TsqError>,
}

/// Uniform view of a task context used by the task manager.
pub trait TaskContext: Send + Sync {
    fn task_id(&self) -> &TaskId;

    fn kind(&self) -> TaskKind;

    fn created_at(&self) -> Instant;

    /// Route one child response into the context.
    fn receive(&self, response: TaskResponse, from: &str);

    /// Whether the terminal value has been emitted.
    fn is_done(&self) -> bool;
}

struct MetricState {
    expected: usize,
    closed: bool,
    aggregator: GroupingAggregator,
    stats: QueryStats,
}

/// Merges grouped time series from leaves or intermediates.
pub struct MetricTaskContext {
    task_id: TaskId,
    kind: TaskKind,
    explain: bool,
    created_at: Instant,
    state: Mutex<MetricState>,
    tx: mpsc::Sender<TimeSeriesEvent>,
}

impl MetricTaskContext {
    /// Build a context waiting for `expected` responses, plus its result queue.
    pub fn new(
        task_id: TaskId,
        kind: TaskKind,
        expected: usize,
        explain: bool,
        node: &str,
    ) -> (Self, mpsc::Receiver<TimeSeriesEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let ctx = Self {
            task_id,
            kind,
            explain,
            created_at: Instant::now(),
            state: Mutex::new(MetricState {
                expected,
                closed: false,
                aggregator: GroupingAggregator::new(),
                stats: QueryStats::new(node),
            }),
            tx,
        };
        if expected == 0 {
            let mut state = ctx.state.lock().expect("task context lock poisoned");
            ctx.emit(&mut state, None);
        }
        (ctx, rx)
    }

    fn emit(&self, state: &mut MetricState, err: Option<TsqError>) {
        state.closed = true;
        let series = if err.is_some() {
            Vec::new()
        } else {
            state.aggregator.take()
        };
        let stats = self.explain.then(|| {
            let mut stats = std::mem::take(&mut state.stats);
            stats.total_cost = self.created_at.elapsed().as_nanos() as i64;
            stats
        });
        if self
            .tx
            .try_send(TimeSeriesEvent { series, stats, err })
            .is_err()
        {
            debug!(task_id = %self.task_id, "result queue has no reader, dropping event");
        }
    }

    fn merge(&self, state: &mut MetricState, response: &TaskResponse, from: &str) -> Result<()> {
        let series = decode_series(&response.payload)?;
        state.aggregator.merge_all(series);
        if !self.explain {
            return Ok(());
        }
        if let Some(raw) = &response.stats {
            match response.response_type {
                ResponseType::Leaf => {
                    let stats: LeafNodeStats = decode_stats(raw)?;
                    state.stats.merge_leaf(from, stats);
                }
                ResponseType::Intermediate => {
                    let stats: BrokerNodeStats = decode_stats(raw)?;
                    state.stats.merge_broker(from, stats);
                }
            }
        }
        Ok(())
    }
}

impl TaskContext for MetricTaskContext {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn receive(&self, response: TaskResponse, from: &str) {
        let mut state = self.state.lock().expect("task context lock poisoned");
        if state.closed {
            return;
        }
        state.expected = state.expected.saturating_sub(1);
        if let Some(err) = response.error() {
            if err.is_not_found() {
                debug!(task_id = %self.task_id, from, error = %err, "child task found nothing");
            } else {
                warn!(task_id = %self.task_id, from, error = %err, "child task failed");
            }
            self.emit(&mut state, Some(err));
            return;
        }
        if let Err(err) = self.merge(&mut state, &response, from) {
            self.emit(&mut state, Some(err));
            return;
        }
        if state.expected == 0 {
            self.emit(&mut state, None);
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().expect("task context lock poisoned").closed
    }
}

struct MetadataState {
    expected: usize,
    closed: bool,
    tx: Option<mpsc::Sender<TaskResponse>>,
}

/// Forwards raw metadata responses; the queue closes after the last one.
pub struct MetadataTaskContext {
    task_id: TaskId,
    kind: TaskKind,
    created_at: Instant,
    state: Mutex<MetadataState>,
}

impl MetadataTaskContext {
    pub fn new(
        task_id: TaskId,
        kind: TaskKind,
        expected: usize,
    ) -> (Self, mpsc::Receiver<TaskResponse>) {
        let (tx, rx) = mpsc::channel(expected.max(1));
        let closed = expected == 0;
        let ctx = Self {
            task_id,
            kind,
            created_at: Instant::now(),
            state: Mutex::new(MetadataState {
                expected,
                closed,
                tx: (!closed).then_some(tx),
            }),
        };
        (ctx, rx)
    }
}

impl TaskContext for MetadataTaskContext {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn receive(&self, response: TaskResponse, _from: &str) {
        let mut state = self.state.lock().expect("task context lock poisoned");
        if state.closed {
            return;
        }
        state.expected = state.expected.saturating_sub(1);
        let terminal = response.is_error() || state.expected == 0;
        if let Some(tx) = &state.tx {
            if tx.try_send(response).is_err() {
                debug!(task_id = %self.task_id, "metadata queue has no reader, dropping response");
            }
        }
        if terminal {
            state.closed = true;
            state.tx = None;
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().expect("task context lock poisoned").closed
    }
}

/// Drain a metadata response queue into a sorted, de-duplicated list.
///
/// `limit == 0` means unlimited. The first error response fails the whole
/// collection.
pub async fn collect_metadata(
    mut rx: mpsc::Receiver<TaskResponse>,
    limit: usize,
) -> Result<Vec<String>> {
    let mut values = BTreeSet::new();
    while let Some(response) = rx.recv().await {
        if let Some(err) = response.error() {
            return Err(err);
        }
        if response.payload.is_empty() {
            continue;
        }
        let batch: Vec<String> = serde_json::from_slice(&response.payload)
            .map_err(|e| TsqError::Decode(format!("metadata payload decode failed: {e}")))?;
        values.extend(batch);
    }
    let mut out: Vec<String> = values.into_iter().collect();
    if limit > 0 {
        out.truncate(limit);
    }
    Ok(out)
}
