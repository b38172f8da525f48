//! Stage, plan-node and operator contracts driven by [`crate::Pipeline`].
//!
//! A stage plans a small operator tree, executes it, and only afterwards
//! reports which stages come next. That lets the local execution shape unfold
//! lazily: metadata lookup decides whether a series filter is needed at all,
//! a filter that matched nothing schedules no scan, and so on.

use std::fmt;
use std::sync::Arc;

use tsq_common::time::now_nanos;
use tsq_common::{Result, TsqError};

use crate::stats::OperatorStats;

/// Closed set of stage kinds the engine knows how to label and measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageType {
    MetadataLookup,
    SeriesFilter,
    DataScan,
    Aggregate,
    MetadataSuggest,
}

impl StageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StageType::MetadataLookup => "metadata_lookup",
            StageType::SeriesFilter => "series_filter",
            StageType::DataScan => "data_scan",
            StageType::Aggregate => "aggregate",
            StageType::MetadataSuggest => "metadata_suggest",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of synchronous work inside a stage.
pub trait Operator: Send + Sync {
    fn identifier(&self) -> String;

    fn execute(&self) -> Result<()>;
}

/// Operator tree produced by [`Stage::plan`]. Parents run before children.
pub struct PlanNode {
    operator: Arc<dyn Operator>,
    children: Vec<PlanNode>,
    ignore_not_found: bool,
}

impl fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanNode")
            .field("operator", &self.operator.identifier())
            .field("children", &self.children)
            .field("ignore_not_found", &self.ignore_not_found)
            .finish()
    }
}

impl PlanNode {
    pub fn new(operator: Arc<dyn Operator>) -> Self {
        Self {
            operator,
            children: Vec::new(),
            ignore_not_found: false,
        }
    }

    /// A node whose `NotFound` failure skips its subtree instead of failing the stage.
    pub fn ignore_not_found(operator: Arc<dyn Operator>) -> Self {
        Self {
            ignore_not_found: true,
            ..Self::new(operator)
        }
    }

    pub fn with_child(mut self, child: PlanNode) -> Self {
        self.children.push(child);
        self
    }

    /// Run the tree, appending per-operator costs to `stats` when given.
    pub fn execute(&self, mut stats: Option<&mut Vec<OperatorStats>>) -> Result<()> {
        let start = now_nanos();
        let result = self.operator.execute();
        if let Some(out) = stats.as_deref_mut() {
            let end = now_nanos();
            out.push(OperatorStats {
                identifier: self.operator.identifier(),
                start,
                end,
                cost: end - start,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
        }
        match result {
            Ok(()) => {}
            Err(err) if self.ignore_not_found && err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        for child in &self.children {
            child.execute(stats.as_deref_mut())?;
        }
        Ok(())
    }
}

type CompletionFn = Box<dyn FnOnce(Result<()>, Vec<OperatorStats>) + Send>;

/// One-shot success/error continuation handed to [`Stage::execute`].
///
/// Consuming methods make double completion impossible. Dropping an unused
/// completion outside of a panic reports an execution error so the pipeline
/// never waits on a stage that forgot to finish.
pub struct StageCompletion {
    explain: bool,
    callback: Option<CompletionFn>,
}

impl StageCompletion {
    pub fn new(
        explain: bool,
        callback: impl FnOnce(Result<()>, Vec<OperatorStats>) + Send + 'static,
    ) -> Self {
        Self {
            explain,
            callback: Some(Box::new(callback)),
        }
    }

    /// Whether operator costs should be collected.
    pub fn explain(&self) -> bool {
        self.explain
    }

    pub fn complete(mut self, result: Result<()>, operators: Vec<OperatorStats>) {
        if let Some(callback) = self.callback.take() {
            callback(result, operators);
        }
    }

    pub fn succeed(self) {
        self.complete(Ok(()), Vec::new());
    }

    pub fn fail(self, err: TsqError) {
        self.complete(Err(err), Vec::new());
    }
}

impl Drop for StageCompletion {
    fn drop(&mut self) {
        // During unwinding the pipeline's panic handler owns the outcome.
        if std::thread::panicking() {
            return;
        }
        if let Some(callback) = self.callback.take() {
            callback(
                Err(TsqError::Execution(
                    "stage dropped its completion without reporting".to_string(),
                )),
                Vec::new(),
            );
        }
    }
}

/// A node of the lazily-unfolding local execution tree.
pub trait Stage: Send + Sync {
    fn stage_type(&self) -> StageType;

    fn identifier(&self) -> String {
        self.stage_type().as_str().to_string()
    }

    /// Run on the worker pool instead of the calling thread.
    fn is_async(&self) -> bool {
        false
    }

    /// Operator tree for this stage; `None` means nothing to run.
    fn plan(&self) -> Option<PlanNode>;

    /// Execute `plan` and report through `completion`.
    ///
    /// The default runs the operator tree inline. Implementations that finish
    /// elsewhere may hold on to `completion` and call it later from any thread.
    fn execute(&self, plan: Option<PlanNode>, completion: StageCompletion) {
        let mut operators = Vec::new();
        let stats = completion.explain().then_some(&mut operators);
        let result = match plan {
            Some(node) => node.execute(stats),
            None => Ok(()),
        };
        completion.complete(result, operators);
    }

    /// Stages to run after this one succeeded; asked exactly once.
    fn next_stages(&self) -> Vec<Arc<dyn Stage>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: fn() -> Result<()>,
    }

    impl Operator for Recording {
        fn identifier(&self) -> String {
            self.name.to_string()
        }

        fn execute(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            (self.outcome)()
        }
    }

    fn op(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        outcome: fn() -> Result<()>,
    ) -> Arc<dyn Operator> {
        Arc::new(Recording {
            name,
            log: Arc::clone(log),
            outcome,
        })
    }

    #[test]
    fn runs_parent_before_children_and_records_costs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tree = PlanNode::new(op("root", &log, || Ok(())))
            .with_child(PlanNode::new(op("left", &log, || Ok(()))))
            .with_child(PlanNode::new(op("right", &log, || Ok(()))));
        let mut stats = Vec::new();
        tree.execute(Some(&mut stats)).expect("execute");
        assert_eq!(*log.lock().unwrap(), vec!["root", "left", "right"]);
        let ids: Vec<_> = stats.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(ids, vec!["root", "left", "right"]);
    }

    #[test]
    fn ignore_not_found_skips_subtree() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tree = PlanNode::ignore_not_found(op("filter", &log, || {
            Err(TsqError::NotFound("series".to_string()))
        }))
        .with_child(PlanNode::new(op("scan", &log, || Ok(()))));
        tree.execute(None).expect("not found is ignored");
        assert_eq!(*log.lock().unwrap(), vec!["filter"]);

        let strict = PlanNode::new(op("filter", &log, || {
            Err(TsqError::NotFound("series".to_string()))
        }));
        assert!(strict.execute(None).is_err());
    }

    #[test]
    fn dropped_completion_reports_error() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let completion = StageCompletion::new(false, move |result, _| {
            *sink.lock().unwrap() = Some(result.is_err());
        });
        drop(completion);
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
