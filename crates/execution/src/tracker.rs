//! Stage state machine for one pipeline run.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tsq_common::time::now_nanos;
use tsq_common::{StageId, TsqError};

use crate::stage::StageType;
use crate::stats::{OperatorStats, StageState, StageStats};

type TrackerCallback = Box<dyn FnOnce(Option<TsqError>, Vec<StageStats>) + Send>;

struct TrackedStage {
    identifier: String,
    stage_type: StageType,
    state: StageState,
    start: i64,
    end: i64,
    error: Option<String>,
    operators: Vec<OperatorStats>,
}

impl TrackedStage {
    fn to_stats(&self) -> StageStats {
        StageStats {
            identifier: self.identifier.clone(),
            stage_type: self.stage_type.as_str().to_string(),
            state: self.state,
            start: self.start,
            end: self.end,
            cost: (self.end - self.start).max(0),
            error: self.error.clone(),
            operators: self.operators.clone(),
        }
    }
}

struct TrackerState {
    next_id: u64,
    pending: usize,
    stages: BTreeMap<StageId, TrackedStage>,
    first_error: Option<TsqError>,
    completed: bool,
    callback: Option<TrackerCallback>,
}

/// Tracks executing/finished/errored stages and fires one completion callback.
///
/// The callback runs once, with the first error seen, when the pending count
/// returns to zero or when [`StageTracker::force_complete`] is called.
/// Timestamps are only taken in explain mode.
pub struct StageTracker {
    explain: bool,
    state: Mutex<TrackerState>,
}

impl StageTracker {
    pub fn new(
        explain: bool,
        on_complete: impl FnOnce(Option<TsqError>, Vec<StageStats>) + Send + 'static,
    ) -> Self {
        Self {
            explain,
            state: Mutex::new(TrackerState {
                next_id: 0,
                pending: 0,
                stages: BTreeMap::new(),
                first_error: None,
                completed: false,
                callback: Some(Box::new(on_complete)),
            }),
        }
    }

    pub fn explain(&self) -> bool {
        self.explain
    }

    /// Register a stage as executing and return its fresh id.
    pub fn begin(&self, identifier: String, stage_type: StageType) -> StageId {
        let start = if self.explain { now_nanos() } else { 0 };
        let mut state = self.state.lock().expect("stage tracker lock poisoned");
        let id = StageId(state.next_id);
        state.next_id += 1;
        state.pending += 1;
        state.stages.insert(
            id,
            TrackedStage {
                identifier,
                stage_type,
                state: StageState::Executing,
                start,
                end: start,
                error: None,
                operators: Vec::new(),
            },
        );
        id
    }

    pub fn finish(&self, id: StageId, operators: Vec<OperatorStats>) {
        self.settle(id, None, operators);
    }

    pub fn fail(&self, id: StageId, err: TsqError, operators: Vec<OperatorStats>) {
        self.settle(id, Some(err), operators);
    }

    /// Complete immediately with `err`, regardless of pending stages.
    pub fn force_complete(&self, err: TsqError) {
        let fire = {
            let mut state = self.state.lock().expect("stage tracker lock poisoned");
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }
            Self::take_completion(&mut state)
        };
        if let Some((callback, err, stats)) = fire {
            callback(err, stats);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .expect("stage tracker lock poisoned")
            .completed
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .expect("stage tracker lock poisoned")
            .pending
    }

    pub fn stats(&self) -> Vec<StageStats> {
        let state = self.state.lock().expect("stage tracker lock poisoned");
        state.stages.values().map(TrackedStage::to_stats).collect()
    }

    fn settle(&self, id: StageId, err: Option<TsqError>, operators: Vec<OperatorStats>) {
        let end = if self.explain { now_nanos() } else { 0 };
        let fire = {
            let mut state = self.state.lock().expect("stage tracker lock poisoned");
            let Some(stage) = state.stages.get_mut(&id) else {
                return;
            };
            if stage.state != StageState::Executing {
                return;
            }
            stage.end = end;
            stage.operators = operators;
            match &err {
                Some(e) => {
                    stage.state = StageState::Error;
                    stage.error = Some(e.to_string());
                }
                None => stage.state = StageState::Finished,
            }
            state.pending = state.pending.saturating_sub(1);
            if let Some(e) = err {
                if state.first_error.is_none() {
                    state.first_error = Some(e);
                }
            }
            if state.pending == 0 {
                Self::take_completion(&mut state)
            } else {
                None
            }
        };
        if let Some((callback, err, stats)) = fire {
            callback(err, stats);
        }
    }

    fn take_completion(
        state: &mut TrackerState,
    ) -> Option<(TrackerCallback, Option<TsqError>, Vec<StageStats>)> {
        if state.completed {
            return None;
        }
        state.completed = true;
        let callback = state.callback.take()?;
        let stats = state.stages.values().map(TrackedStage::to_stats).collect();
        Some((callback, state.first_error.take(), stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker(explain: bool) -> (StageTracker, Arc<Mutex<Vec<Option<String>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let tracker = StageTracker::new(explain, move |err, _| {
            sink.lock().unwrap().push(err.map(|e| e.to_string()));
        });
        (tracker, calls)
    }

    #[test]
    fn completes_once_when_pending_drains() {
        let (tracker, calls) = tracker(true);
        let a = tracker.begin("a".to_string(), StageType::MetadataLookup);
        let b = tracker.begin("b".to_string(), StageType::DataScan);
        tracker.finish(a, Vec::new());
        assert!(calls.lock().unwrap().is_empty());
        tracker.finish(b, Vec::new());
        tracker.finish(b, Vec::new());
        assert_eq!(*calls.lock().unwrap(), vec![None]);
        let stats = tracker.stats();
        assert!(stats.iter().all(|s| s.state == StageState::Finished));
        assert!(stats.iter().all(|s| s.end >= s.start));
    }

    #[test]
    fn reports_first_error() {
        let (tracker, calls) = tracker(false);
        let a = tracker.begin("a".to_string(), StageType::SeriesFilter);
        let b = tracker.begin("b".to_string(), StageType::DataScan);
        tracker.fail(a, TsqError::Execution("first".to_string()), Vec::new());
        tracker.fail(b, TsqError::Execution("second".to_string()), Vec::new());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].as_deref().unwrap_or_default().contains("first"));
    }

    #[test]
    fn force_complete_ignores_later_settles() {
        let (tracker, calls) = tracker(false);
        let a = tracker.begin("a".to_string(), StageType::Aggregate);
        tracker.force_complete(TsqError::Panic("boom".to_string()));
        tracker.finish(a, Vec::new());
        assert!(tracker.is_completed());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
