//! Pipeline driver for lazily-unfolding stage trees.
//!
//! `Pipeline::execute(root)` registers the stage with the [`StageTracker`],
//! runs it (inline or on the [`WorkerPool`]), and on success asks it for its
//! next stages, scheduling them before marking it finished so the pending
//! count never reaches zero while work remains. Panics inside any stage are
//! contained here and force completion with [`TsqError::Panic`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};
use tsq_common::metrics::global_metrics;
use tsq_common::{RequestId, Result, StageId, TsqError};

use crate::pool::WorkerPool;
use crate::stage::{Stage, StageCompletion};
use crate::stats::{OperatorStats, StageStats};
use crate::tracker::StageTracker;

/// One local execution of a stage tree for a request.
pub struct Pipeline {
    request_id: RequestId,
    pool: WorkerPool,
    tracker: StageTracker,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("request_id", &self.request_id)
            .field("explain", &self.tracker.explain())
            .field("completed", &self.tracker.is_completed())
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline whose `on_complete` fires exactly once.
    pub fn new(
        request_id: RequestId,
        explain: bool,
        pool: WorkerPool,
        on_complete: impl FnOnce(Option<TsqError>, Vec<StageStats>) + Send + 'static,
    ) -> Arc<Self> {
        global_metrics().record_pipeline("started");
        let rid = request_id.clone();
        let tracker = StageTracker::new(explain, move |err, stats| {
            let outcome = match &err {
                None => "finished",
                Some(TsqError::Panic(_)) => "panicked",
                Some(_) => "failed",
            };
            global_metrics().record_pipeline(outcome);
            debug!(request_id = %rid, outcome, stages = stats.len(), "pipeline completed");
            on_complete(err, stats);
        });
        Arc::new(Self {
            request_id,
            pool,
            tracker,
        })
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn is_completed(&self) -> bool {
        self.tracker.is_completed()
    }

    /// Snapshot of per-stage stats collected so far.
    pub fn stats(&self) -> Vec<StageStats> {
        self.tracker.stats()
    }

    /// Schedule `stage` and, transitively, every stage it unfolds into.
    pub fn execute(self: &Arc<Self>, stage: Arc<dyn Stage>) {
        let id = self.tracker.begin(stage.identifier(), stage.stage_type());
        if stage.is_async() {
            let pipeline = Arc::clone(self);
            self.pool.submit(move || pipeline.run_stage(id, stage));
        } else {
            self.run_stage(id, stage);
        }
    }

    fn run_stage(self: &Arc<Self>, id: StageId, stage: Arc<dyn Stage>) {
        let pipeline = Arc::clone(self);
        let done_stage = Arc::clone(&stage);
        let started = Instant::now();
        let completion = StageCompletion::new(self.tracker.explain(), move |result, operators| {
            pipeline.on_stage_done(id, done_stage, started, result, operators);
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let plan = stage.plan();
            stage.execute(plan, completion);
        }));
        if let Err(payload) = outcome {
            self.on_panic(stage.as_ref(), payload);
        }
    }

    fn on_stage_done(
        self: &Arc<Self>,
        id: StageId,
        stage: Arc<dyn Stage>,
        started: Instant,
        result: Result<()>,
        operators: Vec<OperatorStats>,
    ) {
        let elapsed = started.elapsed().as_secs_f64();
        let stage_type = stage.stage_type().as_str();
        match result {
            Ok(()) => {
                let next = panic::catch_unwind(AssertUnwindSafe(|| stage.next_stages()));
                match next {
                    Ok(next) => {
                        for next_stage in next {
                            self.execute(next_stage);
                        }
                        global_metrics().record_stage(stage_type, "ok", elapsed);
                        self.tracker.finish(id, operators);
                    }
                    Err(payload) => self.on_panic(stage.as_ref(), payload),
                }
            }
            Err(err) => {
                if !err.is_not_found() {
                    error!(
                        request_id = %self.request_id,
                        stage = %stage.identifier(),
                        error = %err,
                        "pipeline stage failed"
                    );
                }
                global_metrics().record_stage(stage_type, "error", elapsed);
                self.tracker.fail(id, err, operators);
            }
        }
    }

    fn on_panic(&self, stage: &dyn Stage, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        let backtrace = Backtrace::force_capture();
        error!(
            request_id = %self.request_id,
            stage = %stage.identifier(),
            panic = %message,
            backtrace = %backtrace,
            "pipeline stage panicked"
        );
        global_metrics().record_stage(stage.stage_type().as_str(), "panic", 0.0);
        self.tracker.force_complete(TsqError::Panic(format!(
            "stage {} panicked: {message}",
            stage.identifier()
        )));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
