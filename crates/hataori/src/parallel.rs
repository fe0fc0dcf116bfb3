//! Concurrent execution of steps with bounded fan-out.

use crate::base::{BaseWorkflowAgent, RunTracker};
use crate::workflow::{workflow_agent, Workflow};
use async_trait::async_trait;
use hataori_core::{
    Context, EventType, State, StepName, StepState, Value, WorkflowError, WorkflowKind,
    WorkflowState, WorkflowStep,
};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// User-supplied merge of the successful results, keyed by step name.
pub type MergeFn = Arc<dyn Fn(&HashMap<StepName, Arc<State>>) -> Arc<State> + Send + Sync>;

/// How the results of a parallel run are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// A clone of the input with `parallel_results` (and
    /// `parallel_errors` when steps failed) attached.
    #[default]
    All,
    /// The output of the first step to succeed.
    First,
    /// The output of the configured [`MergeFn`].
    Custom,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strategy = match self {
            MergeStrategy::All => "all",
            MergeStrategy::First => "first",
            MergeStrategy::Custom => "custom",
        };
        f.write_str(strategy)
    }
}

/// Configuration for a [`ParallelAgent`].
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Steps allowed to run at once; 0 means unbounded.
    pub max_concurrency: usize,
    pub merge_strategy: MergeStrategy,
    /// Deadline for the whole fan-out.
    pub timeout: Option<Duration>,
    /// Keys copied from each result into `parallel_results`.
    pub result_keys: Vec<String>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            merge_strategy: MergeStrategy::All,
            timeout: None,
            result_keys: vec!["response".to_string(), "result".to_string()],
        }
    }
}

#[derive(Default)]
struct Collector {
    results: HashMap<StepName, Arc<State>>,
    errors: HashMap<StepName, WorkflowError>,
    first: Option<StepName>,
    closed: bool,
}

/// Runs all steps concurrently against the same input and merges their
/// results.
///
/// Every step is spawned up front; when `max_concurrency` is set, steps
/// wait for a permit before they start. Steps receive the shared input
/// and must return their own state instead of mutating it.
///
/// A step failure never cancels its siblings. The run fails only when no
/// step succeeded; otherwise the failures are recorded in the status and,
/// for [`MergeStrategy::All`], in the merged state.
///
/// When the context ends (cancellation or the configured timeout) the
/// run stops waiting: steps still running are recorded as failed with
/// the context error and left to finish on their own, and their late
/// results are discarded.
pub struct ParallelAgent {
    base: BaseWorkflowAgent,
    config: ParallelConfig,
    merge_fn: Option<MergeFn>,
}

impl fmt::Debug for ParallelAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelAgent")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("merge_fn", &self.merge_fn.is_some())
            .finish()
    }
}

workflow_agent!(ParallelAgent);

impl ParallelAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: BaseWorkflowAgent::new(name, WorkflowKind::Parallel),
            config: ParallelConfig::default(),
            merge_fn: None,
        }
    }

    pub fn with_config(mut self, config: ParallelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.config.merge_strategy = strategy;
        self
    }

    /// Sets the merge function and selects [`MergeStrategy::Custom`].
    pub fn with_merge_fn<F>(mut self, merge: F) -> Self
    where
        F: Fn(&HashMap<StepName, Arc<State>>) -> Arc<State> + Send + Sync + 'static,
    {
        self.merge_fn = Some(Arc::new(merge));
        self.config.merge_strategy = MergeStrategy::Custom;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn with_result_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.config.result_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Adds a step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DuplicateStep`] if the name is taken.
    pub fn add_step<S: WorkflowStep + 'static>(&mut self, step: S) -> Result<(), WorkflowError> {
        self.base.add_step(Arc::new(step))
    }

    /// Builder form of [`add_step`](ParallelAgent::add_step).
    pub fn with_step<S: WorkflowStep + 'static>(mut self, step: S) -> Result<Self, WorkflowError> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn steps(&self) -> &[Arc<dyn WorkflowStep>] {
        self.base.steps()
    }

    async fn execute_parallel(
        &self,
        ctx: &Context,
        input: &Arc<State>,
    ) -> Result<Arc<State>, WorkflowError> {
        let ctx = match self.config.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let shared = WorkflowState::new(input.clone());
        let semaphore = (self.config.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrency)));
        let collector = Arc::new(Mutex::new(Collector::default()));

        let mut tasks = JoinSet::new();
        for step in self.base.steps() {
            tasks.spawn(run_branch(
                step.clone(),
                ctx.clone(),
                shared.clone(),
                semaphore.clone(),
                collector.clone(),
                self.base.tracker().clone(),
            ));
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        warn!(
                            workflow = %self.base.name(),
                            error = %e,
                            "Parallel step task failed"
                        );
                    }
                    None => break,
                },
                _ = ctx.done() => {
                    debug!(
                        workflow = %self.base.name(),
                        remaining = tasks.len(),
                        "Context ended while joining parallel steps"
                    );
                    break;
                }
            }
        }

        let (results, mut errors, first) = {
            let mut collector = collector.lock();
            collector.closed = true;
            (
                std::mem::take(&mut collector.results),
                std::mem::take(&mut collector.errors),
                collector.first.take(),
            )
        };
        // leave unfinished steps running; nothing is preempted
        tasks.detach_all();

        let tracker = self.base.tracker();
        for step in self.base.steps() {
            let name = step.name();
            if results.contains_key(&name) || errors.contains_key(&name) {
                continue;
            }
            let error = ctx.err().unwrap_or_else(|| {
                WorkflowError::step(name.clone(), "step task ended unexpectedly")
            });
            tracker.step_finished(&name, StepState::Failed, Some(&error));
            errors.insert(name, error);
        }

        info!(
            workflow = %self.base.name(),
            successful = results.len(),
            failed = errors.len(),
            "Parallel steps joined"
        );

        if results.is_empty() {
            return Err(WorkflowError::ParallelFailed {
                failed: errors.len(),
            });
        }
        // a custom merge only ever sees a complete result set
        if !errors.is_empty() && self.config.merge_strategy == MergeStrategy::Custom {
            return Err(WorkflowError::ParallelFailed {
                failed: errors.len(),
            });
        }
        if !errors.is_empty() {
            tracker.set_run_error(&WorkflowError::PartialFailure {
                failed: errors.len(),
            });
        }

        self.merge(input, results, &errors, first)
    }

    fn merge(
        &self,
        input: &Arc<State>,
        results: HashMap<StepName, Arc<State>>,
        errors: &HashMap<StepName, WorkflowError>,
        first: Option<StepName>,
    ) -> Result<Arc<State>, WorkflowError> {
        match self.config.merge_strategy {
            MergeStrategy::First => {
                let winner = first
                    .and_then(|name| results.get(&name).cloned().map(|state| (name, state)));
                let Some((name, state)) = winner else {
                    return Err(WorkflowError::ParallelFailed {
                        failed: errors.len(),
                    });
                };
                self.base.emit(
                    EventType::Progress,
                    json!({
                        "message": format!("Using result from first completed step: {name}"),
                        "step": name,
                    }),
                );
                Ok(state)
            }
            MergeStrategy::Custom => {
                let merge = self
                    .merge_fn
                    .as_ref()
                    .ok_or(WorkflowError::MissingMergeFunction)?;
                Ok(merge(&results))
            }
            MergeStrategy::All => {
                let merged = input.as_ref().clone();

                let mut parallel_results = Map::new();
                for (name, state) in &results {
                    let payload: Map<String, Value> = self
                        .config
                        .result_keys
                        .iter()
                        .filter_map(|key| state.get(key).map(|value| (key.clone(), value)))
                        .collect();
                    parallel_results.insert(name.to_string(), Value::Object(payload));
                }
                merged.set("parallel_results", Value::Object(parallel_results));

                if !errors.is_empty() {
                    let parallel_errors: Map<String, Value> = errors
                        .iter()
                        .map(|(name, e)| (name.to_string(), Value::String(e.to_string())))
                        .collect();
                    merged.set("parallel_errors", Value::Object(parallel_errors));
                }
                Ok(Arc::new(merged))
            }
        }
    }
}

/// Body of one spawned step.
async fn run_branch(
    step: Arc<dyn WorkflowStep>,
    ctx: Context,
    input: WorkflowState,
    semaphore: Option<Arc<Semaphore>>,
    collector: Arc<Mutex<Collector>>,
    tracker: RunTracker,
) {
    let name = step.name();

    let _permit = match semaphore {
        Some(semaphore) => tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => {
                    record(&collector, &tracker, name, Err(WorkflowError::Canceled));
                    return;
                }
            },
            _ = ctx.done() => {
                let error = ctx.err().unwrap_or(WorkflowError::Canceled);
                record(&collector, &tracker, name, Err(error));
                return;
            }
        },
        None => None,
    };

    tracker.step_started(&name);
    tracker.emit(
        EventType::WorkflowStep,
        json!({ "step": name, "parallel": true }),
    );

    let result = step.execute(&ctx, &input).await;
    record(&collector, &tracker, name, result.map(WorkflowState::into_state));
}

fn record(
    collector: &Mutex<Collector>,
    tracker: &RunTracker,
    name: StepName,
    result: Result<Arc<State>, WorkflowError>,
) {
    let mut collector = collector.lock();
    if collector.closed {
        debug!(step = %name, "Discarding parallel result that arrived after the join");
        return;
    }
    match result {
        Ok(state) => {
            tracker.step_finished(&name, StepState::Completed, None);
            tracker.emit(
                EventType::Progress,
                json!({ "step": name, "complete": true }),
            );
            if collector.first.is_none() {
                collector.first = Some(name.clone());
            }
            collector.results.insert(name, state);
        }
        Err(e) => {
            tracker.step_finished(&name, StepState::Failed, Some(&e));
            tracker.emit_error(json!({ "step": name, "error": e.to_string() }), &e);
            collector.errors.insert(name, e);
        }
    }
}

#[async_trait]
impl Workflow for ParallelAgent {
    fn base(&self) -> &BaseWorkflowAgent {
        &self.base
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        self.base.validate()?;
        if self.config.merge_strategy == MergeStrategy::Custom && self.merge_fn.is_none() {
            return Err(WorkflowError::MissingMergeFunction);
        }
        Ok(())
    }

    async fn run(&self, ctx: &Context, input: Arc<State>) -> Result<Arc<State>, WorkflowError> {
        Workflow::validate(self).map_err(WorkflowError::invalid)?;

        let steps = self.base.steps();
        let names = steps.iter().map(|step| step.name()).collect();
        let ctx = self
            .base
            .begin_run(
                ctx,
                &input,
                names,
                json!({
                    "steps": steps.len(),
                    "max_concurrency": self.config.max_concurrency,
                    "merge_strategy": self.config.merge_strategy.to_string(),
                }),
            )
            .await;

        let result = self.execute_parallel(&ctx, &input).await;
        self.base.finish_run(&ctx, &input, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_fn::FnStep;
    use hataori_core::RunState;

    fn responder(name: &'static str, delay_ms: u64) -> FnStep {
        FnStep::new(name, move |ctx: Context, input: WorkflowState| async move {
            ctx.sleep(Duration::from_millis(delay_ms)).await?;
            let state = State::new();
            state.set("response", name);
            state.set("scratch", "ignored");
            Ok(input.with_state(Arc::new(state)))
        })
    }

    fn failing(name: &'static str) -> FnStep {
        FnStep::from_fn(name, move |_: &WorkflowState| {
            Err(WorkflowError::step(name, "boom"))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_all_collects_results_and_errors() {
        let agent = ParallelAgent::new("fan")
            .with_step(responder("a", 5))
            .unwrap()
            .with_step(responder("b", 1))
            .unwrap()
            .with_step(failing("c"))
            .unwrap();

        let input = State::with_values([("topic", "rust")]).shared();
        let output = agent.run(&Context::new(), input.clone()).await.unwrap();

        assert_eq!(output.parent_id(), Some(input.id()));
        assert_eq!(output.get_as::<String>("topic").as_deref(), Some("rust"));
        let results = output.get("parallel_results").unwrap();
        assert_eq!(results["a"], json!({ "response": "a" }));
        assert_eq!(results["b"], json!({ "response": "b" }));
        let errors = output.get("parallel_errors").unwrap();
        assert!(errors["c"].as_str().unwrap().contains("boom"));

        let status = agent.status();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.error.as_deref(), Some("completed with 1 errors"));
        assert!(!input.has("parallel_results"));
    }

    #[tokio::test]
    async fn test_all_failures_fail_the_run() {
        let agent = ParallelAgent::new("fan")
            .with_step(failing("a"))
            .unwrap()
            .with_step(failing("b"))
            .unwrap();

        let err = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ParallelFailed { failed: 2 }));
        assert_eq!(agent.status().state, RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_merge() {
        let agent = ParallelAgent::new("fan")
            .with_step(responder("a", 1))
            .unwrap()
            .with_step(responder("b", 2))
            .unwrap()
            .with_merge_fn(|results| {
                let merged = State::new();
                let mut names: Vec<_> = results.keys().map(|n| n.to_string()).collect();
                names.sort();
                merged.set("names", names);
                Arc::new(merged)
            });

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();
        assert_eq!(output.get("names"), Some(json!(["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_merge_fails_on_any_step_error() {
        let agent = ParallelAgent::new("fan")
            .with_step(responder("a", 1))
            .unwrap()
            .with_step(failing("b"))
            .unwrap()
            .with_merge_fn(|_| Arc::new(State::new()));

        let err = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ParallelFailed { failed: 1 }));
        assert_eq!(agent.status().state, RunState::Failed);
        assert_eq!(agent.status().step_state("a"), Some(StepState::Completed));
    }

    #[tokio::test]
    async fn test_custom_without_function_is_invalid() {
        let agent = ParallelAgent::new("fan")
            .with_step(failing("a"))
            .unwrap()
            .with_merge_strategy(MergeStrategy::Custom);

        let err = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            WorkflowError::MissingMergeFunction
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_slow_steps() {
        let stubborn = FnStep::new("stubborn", |_ctx: Context, input: WorkflowState| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(input)
        });
        let agent = ParallelAgent::new("fan")
            .with_timeout(Duration::from_millis(50))
            .with_step(responder("fast", 1))
            .unwrap()
            .with_step(stubborn)
            .unwrap();

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        let errors = output.get("parallel_errors").unwrap();
        assert_eq!(errors["stubborn"], json!("context deadline exceeded"));
        let status = agent.status();
        assert_eq!(status.step_state("stubborn"), Some(StepState::Failed));
        assert_eq!(status.step_state("fast"), Some(StepState::Completed));
    }
}
