//! Iterate-until-terminate execution of a single body step.

use crate::base::BaseWorkflowAgent;
use crate::workflow::{workflow_agent, Workflow};
use async_trait::async_trait;
use hataori_core::{
    Context, EventType, RetryPolicy, State, StateSnapshot, StepName, WorkflowError, WorkflowKind,
    WorkflowState, WorkflowStep,
};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Loop condition, called with the current state and the number of
/// iterations completed so far.
pub type LoopCondition = Arc<dyn Fn(&State, u32) -> bool + Send + Sync>;

/// Configuration for a [`LoopAgent`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound on iterations; 0 means unbounded.
    pub max_iterations: u32,
    /// Upper bound on the loop's wall time.
    pub max_duration: Option<Duration>,
    /// Record an [`IterationResult`] per iteration.
    pub collect_results: bool,
    /// Fail the run on the first failed iteration.
    pub break_on_error: bool,
    /// Feed each iteration's output into the next one. Otherwise every
    /// iteration starts from the original input.
    pub pass_state_through: bool,
    /// Pause between iterations.
    pub iteration_delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_duration: None,
            collect_results: true,
            break_on_error: true,
            pass_state_through: true,
            iteration_delay: Duration::ZERO,
        }
    }
}

/// Outcome of one iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Zero-based index.
    pub iteration: u32,
    pub duration: Duration,
    /// The iteration's output, or the state it started from if it failed.
    pub state: Option<StateSnapshot>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct LoopProgress {
    current_iteration: u32,
    started: Option<Instant>,
    finished: Option<Instant>,
    results: Vec<IterationResult>,
}

/// Why a loop stopped without failing.
#[derive(Debug, Clone, Copy)]
enum Termination {
    MaxIterations,
    MaxDuration,
    ContinueConditionFalse,
    BreakConditionTrue,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Termination::MaxIterations => "max_iterations_reached",
            Termination::MaxDuration => "max_duration_reached",
            Termination::ContinueConditionFalse => "continue_condition_false",
            Termination::BreakConditionTrue => "break_condition_true",
        };
        f.write_str(reason)
    }
}

/// Executes a body step repeatedly until a termination condition holds.
///
/// Before each iteration the loop checks, in order: the context, the
/// iteration limit, the duration limit, the continue condition (stop when
/// false) and the break condition (stop when true). At least one of the
/// limits or conditions must be configured.
///
/// The result is the output of the last successful iteration, or a copy
/// of the input if none succeeded, with `total_iterations`,
/// `total_duration_ms` and `loop_completed` in its metadata.
pub struct LoopAgent {
    base: BaseWorkflowAgent,
    config: LoopConfig,
    body: Option<Arc<dyn WorkflowStep>>,
    continue_condition: Option<LoopCondition>,
    break_condition: Option<LoopCondition>,
    progress: Mutex<LoopProgress>,
}

impl fmt::Debug for LoopAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopAgent")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("body", &self.body.as_ref().map(|body| body.name()))
            .field("continue_condition", &self.continue_condition.is_some())
            .field("break_condition", &self.break_condition.is_some())
            .field("current_iteration", &self.progress.lock().current_iteration)
            .finish()
    }
}

workflow_agent!(LoopAgent);

impl LoopAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: BaseWorkflowAgent::new(name, WorkflowKind::Loop),
            config: LoopConfig::default(),
            body: None,
            continue_condition: None,
            break_condition: None,
            progress: Mutex::new(LoopProgress::default()),
        }
    }

    /// A loop that runs `body` while `condition` holds.
    pub fn while_loop<F, S>(name: impl Into<String>, condition: F, body: S) -> Self
    where
        F: Fn(&State, u32) -> bool + Send + Sync + 'static,
        S: WorkflowStep + 'static,
    {
        Self::new(name).with_body(body).with_while_condition(condition)
    }

    /// A loop that runs `body` until `condition` holds.
    pub fn until_loop<F, S>(name: impl Into<String>, condition: F, body: S) -> Self
    where
        F: Fn(&State, u32) -> bool + Send + Sync + 'static,
        S: WorkflowStep + 'static,
    {
        Self::new(name).with_body(body).with_until_condition(condition)
    }

    /// A loop that runs `body` exactly `count` times unless it fails.
    pub fn count_loop<S: WorkflowStep + 'static>(
        name: impl Into<String>,
        count: u32,
        body: S,
    ) -> Self {
        Self::new(name).with_body(body).with_max_iterations(count)
    }

    pub fn set_loop_body<S: WorkflowStep + 'static>(&mut self, body: S) {
        self.body = Some(Arc::new(body));
    }

    pub fn with_body<S: WorkflowStep + 'static>(mut self, body: S) -> Self {
        self.set_loop_body(body);
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_while_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&State, u32) -> bool + Send + Sync + 'static,
    {
        self.continue_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_until_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&State, u32) -> bool + Send + Sync + 'static,
    {
        self.break_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.config.max_duration = Some(max);
        self
    }

    pub fn with_collect_results(mut self, collect: bool) -> Self {
        self.config.collect_results = collect;
        self
    }

    pub fn with_break_on_error(mut self, break_on_error: bool) -> Self {
        self.config.break_on_error = break_on_error;
        self
    }

    pub fn with_pass_state_through(mut self, pass_through: bool) -> Self {
        self.config.pass_state_through = pass_through;
        self
    }

    pub fn with_iteration_delay(mut self, delay: Duration) -> Self {
        self.config.iteration_delay = delay;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn loop_body(&self) -> Option<&Arc<dyn WorkflowStep>> {
        self.body.as_ref()
    }

    /// Results recorded by the last run.
    pub fn iteration_results(&self) -> Vec<IterationResult> {
        self.progress.lock().results.clone()
    }

    /// Iterations completed by the current or last run.
    pub fn current_iteration(&self) -> u32 {
        self.progress.lock().current_iteration
    }

    /// Time spent in the current or last run; zero before the first run.
    pub fn total_duration(&self) -> Duration {
        let progress = self.progress.lock();
        match (progress.started, progress.finished) {
            (Some(started), Some(finished)) => finished - started,
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Clears the iteration counter, timings and collected results.
    pub fn reset(&self) {
        *self.progress.lock() = LoopProgress::default();
    }

    fn termination(&self, state: &State, iteration: u32, started: Instant) -> Option<Termination> {
        if self.config.max_iterations > 0 && iteration >= self.config.max_iterations {
            return Some(Termination::MaxIterations);
        }
        if let Some(max) = self.config.max_duration {
            if started.elapsed() >= max {
                return Some(Termination::MaxDuration);
            }
        }
        if let Some(condition) = &self.continue_condition {
            if !condition(state, iteration) {
                return Some(Termination::ContinueConditionFalse);
            }
        }
        if let Some(condition) = &self.break_condition {
            if condition(state, iteration) {
                return Some(Termination::BreakConditionTrue);
            }
        }
        None
    }

    fn record(&self, result: IterationResult) {
        if self.config.collect_results {
            self.progress.lock().results.push(result);
        }
    }

    async fn execute_loop(
        &self,
        ctx: &Context,
        body: &Arc<dyn WorkflowStep>,
        input: &Arc<State>,
    ) -> Result<Arc<State>, WorkflowError> {
        let started = Instant::now();
        *self.progress.lock() = LoopProgress {
            started: Some(started),
            ..LoopProgress::default()
        };

        let original = WorkflowState::new(input.clone());
        let mut current = original.clone();
        let mut last_output: Option<WorkflowState> = None;

        loop {
            self.base.wait_while_paused(ctx).await?;
            if let Some(e) = ctx.err() {
                return Err(e);
            }

            let iteration = self.current_iteration();
            if let Some(reason) = self.termination(current.state(), iteration, started) {
                info!(
                    workflow = %self.base.name(),
                    iteration,
                    reason = %reason,
                    "Loop terminated"
                );
                self.base.emit(
                    EventType::Progress,
                    json!({ "reason": reason.to_string(), "iteration": iteration }),
                );
                break;
            }

            if iteration > 0 && !self.config.iteration_delay.is_zero() {
                ctx.sleep(self.config.iteration_delay).await?;
            }

            let name = StepName::new(format!("iteration-{iteration}"));
            self.base.emit(
                EventType::WorkflowStep,
                json!({ "iteration": iteration, "step": "iteration_start" }),
            );

            let iteration_input = if self.config.pass_state_through {
                current.clone()
            } else {
                original.clone()
            };
            let iteration_started = Instant::now();
            let outcome = self
                .base
                .run_step(ctx, body, &name, &iteration_input, &RetryPolicy::None)
                .await;
            let duration = iteration_started.elapsed();

            match outcome {
                Ok(output) => {
                    self.record(IterationResult {
                        iteration,
                        duration,
                        state: Some(output.state().snapshot()),
                        error: None,
                    });
                    if self.config.pass_state_through {
                        current = output.clone();
                    }
                    last_output = Some(output);
                }
                Err(e) => {
                    self.record(IterationResult {
                        iteration,
                        duration,
                        state: Some(iteration_input.state().snapshot()),
                        error: Some(e.to_string()),
                    });
                    if self.config.break_on_error || ctx.is_done() {
                        return Err(WorkflowError::IterationFailed {
                            iteration,
                            source: Box::new(e),
                        });
                    }
                    warn!(
                        workflow = %self.base.name(),
                        iteration,
                        error = %e,
                        "Iteration failed, continuing"
                    );
                }
            }

            self.base.emit(
                EventType::Progress,
                json!({
                    "iteration": iteration,
                    "step": "iteration_complete",
                    "duration_ms": duration.as_millis() as u64,
                }),
            );
            self.progress.lock().current_iteration += 1;
            debug!(workflow = %self.base.name(), iteration, "Iteration finished");
        }

        let result = match last_output {
            Some(output) if !Arc::ptr_eq(output.state(), input) => output.into_state(),
            _ => Arc::new(input.as_ref().clone()),
        };
        let (total_iterations, total_duration) = {
            let mut progress = self.progress.lock();
            let finished = Instant::now();
            progress.finished = Some(finished);
            (progress.current_iteration, finished - started)
        };
        result.set_metadata("total_iterations", total_iterations);
        result.set_metadata("total_duration_ms", total_duration.as_millis() as u64);
        result.set_metadata("loop_completed", true);
        Ok(result)
    }
}

#[async_trait]
impl Workflow for LoopAgent {
    fn base(&self) -> &BaseWorkflowAgent {
        &self.base
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        self.base.validate_name()?;
        let Some(body) = &self.body else {
            return Err(WorkflowError::configuration(
                "loop workflow must have a loop body",
            ));
        };
        body.validate().map_err(|e| {
            WorkflowError::configuration(format!("loop body validation failed: {e}"))
        })?;
        let has_termination = self.config.max_iterations > 0
            || self.config.max_duration.is_some()
            || self.continue_condition.is_some()
            || self.break_condition.is_some();
        if !has_termination {
            return Err(WorkflowError::configuration(
                "loop workflow must have at least one termination condition",
            ));
        }
        Ok(())
    }

    async fn run(&self, ctx: &Context, input: Arc<State>) -> Result<Arc<State>, WorkflowError> {
        Workflow::validate(self).map_err(WorkflowError::invalid)?;
        let Some(body) = &self.body else {
            return Err(WorkflowError::invalid(WorkflowError::configuration(
                "loop workflow must have a loop body",
            )));
        };

        let ctx = self
            .base
            .begin_run(
                ctx,
                &input,
                Vec::new(),
                json!({
                    "max_iterations": self.config.max_iterations,
                    "max_duration_ms": self.config.max_duration.map(|d| d.as_millis() as u64),
                    "collect_results": self.config.collect_results,
                }),
            )
            .await;

        let result = self.execute_loop(&ctx, body, &input).await;
        if result.is_err() {
            self.progress.lock().finished = Some(Instant::now());
        }
        self.base.finish_run(&ctx, &input, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_fn::FnStep;
    use hataori_core::{RunState, StepState};

    fn counter() -> FnStep {
        FnStep::from_fn("count", |input: &WorkflowState| {
            let state = input.state().as_ref().clone();
            let count = state.get_as::<u32>("count").unwrap_or_default();
            state.set("count", count + 1);
            Ok(input.with_state(Arc::new(state)))
        })
    }

    #[tokio::test]
    async fn test_until_condition_sees_threaded_state() {
        let agent = LoopAgent::until_loop(
            "until",
            |state: &State, _| state.get_as::<u32>("count") == Some(4),
            counter(),
        );

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(output.get_as::<u32>("count"), Some(4));
        assert_eq!(agent.current_iteration(), 4);
        assert_eq!(output.metadata("total_iterations"), Some(json!(4)));
        assert_eq!(output.metadata("loop_completed"), Some(json!(true)));
        assert_eq!(agent.iteration_results().len(), 4);
    }

    #[tokio::test]
    async fn test_while_condition_sees_iteration_count() {
        let agent = LoopAgent::while_loop("while", |_: &State, iteration| iteration < 2, counter());

        agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();
        assert_eq!(agent.current_iteration(), 2);
    }

    #[tokio::test]
    async fn test_without_pass_through_every_iteration_sees_input() {
        let agent = LoopAgent::count_loop("fresh", 3, counter()).with_pass_state_through(false);

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(output.get_as::<u32>("count"), Some(1));
        for result in agent.iteration_results() {
            let snapshot = result.state.unwrap();
            assert_eq!(snapshot.values.get("count"), Some(&json!(1)));
        }
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_pre_failure_state() {
        let flaky = FnStep::from_fn("flaky", |input: &WorkflowState| {
            let count = input.state().get_as::<u32>("count").unwrap_or_default();
            if count == 1 {
                return Err(WorkflowError::step("flaky", "odd"));
            }
            let state = input.state().as_ref().clone();
            state.set("count", count + 1);
            Ok(input.with_state(Arc::new(state)))
        });
        let agent = LoopAgent::count_loop("tolerant", 3, flaky).with_break_on_error(false);

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(output.get_as::<u32>("count"), Some(1));
        assert_eq!(agent.current_iteration(), 3);
        let results = agent.iteration_results();
        assert!(results[0].error.is_none());
        assert!(results[1].error.is_some());
        assert_eq!(
            agent.status().step_state("iteration-1"),
            Some(StepState::Failed)
        );
        assert_eq!(agent.status().state, RunState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration() {
        let slow = FnStep::new("slow", |ctx: Context, input: WorkflowState| async move {
            ctx.sleep(Duration::from_millis(10)).await?;
            Ok(input)
        });
        let agent = LoopAgent::new("timed")
            .with_body(slow)
            .with_max_duration(Duration::from_millis(35));

        agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(agent.current_iteration(), 4);
        assert!(agent.total_duration() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_pass_through_body_leaves_input_untouched() {
        let identity = FnStep::from_fn("identity", |input: &WorkflowState| Ok(input.clone()));
        let agent = LoopAgent::count_loop("idle", 2, identity);
        let input = State::with_values([("topic", "rust")]).shared();
        let version = input.version();

        let output = agent.run(&Context::new(), input.clone()).await.unwrap();

        assert!(!Arc::ptr_eq(&output, &input));
        assert_eq!(output.parent_id(), Some(input.id()));
        assert_eq!(output.metadata("loop_completed"), Some(json!(true)));
        assert_eq!(input.version(), version);
        assert!(input.all_metadata().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let agent = Arc::new(
            LoopAgent::count_loop("delayed", 10, counter())
                .with_iteration_delay(Duration::from_secs(60)),
        );

        let runner = agent.clone();
        let handle = tokio::spawn(async move {
            runner.run(&Context::new(), State::new().shared()).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(agent.cancel());

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(agent.current_iteration(), 1);
        assert_eq!(agent.status().state, RunState::Canceled);
    }

    #[test]
    fn test_validation() {
        let no_body = LoopAgent::new("loop").with_max_iterations(1);
        assert!(no_body.validate().is_err());

        let unbounded = LoopAgent::new("loop").with_body(counter());
        assert!(unbounded.validate().is_err());

        assert!(LoopAgent::count_loop("loop", 1, counter()).validate().is_ok());
    }

    #[tokio::test]
    async fn test_reset() {
        let agent = LoopAgent::count_loop("loop", 2, counter());
        agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();
        assert_eq!(agent.current_iteration(), 2);

        agent.reset();
        assert_eq!(agent.current_iteration(), 0);
        assert!(agent.iteration_results().is_empty());
        assert_eq!(agent.total_duration(), Duration::ZERO);
    }
}
