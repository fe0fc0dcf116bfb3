//! Ordered execution of steps.

use crate::base::BaseWorkflowAgent;
use crate::workflow::{workflow_agent, Workflow};
use async_trait::async_trait;
use hataori_core::{
    Context, EventType, RetryPolicy, State, WorkflowError, WorkflowKind, WorkflowState,
    WorkflowStep,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Configuration for a [`SequentialAgent`].
#[derive(Debug, Clone)]
pub struct SequentialConfig {
    /// Abort the run at the first failed step.
    pub stop_on_error: bool,
    /// Retry policy applied to every step.
    pub retry_policy: RetryPolicy,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            retry_policy: RetryPolicy::None,
        }
    }
}

/// Runs steps one after another in registration order, feeding each
/// step's output into the next.
///
/// A failed step stops the run by default. With `stop_on_error` disabled
/// the failure is recorded and the next step receives the last successful
/// state.
#[derive(Debug)]
pub struct SequentialAgent {
    base: BaseWorkflowAgent,
    config: SequentialConfig,
}

workflow_agent!(SequentialAgent);

impl SequentialAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: BaseWorkflowAgent::new(name, WorkflowKind::Sequential),
            config: SequentialConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SequentialConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.config.stop_on_error = stop;
        self
    }

    /// Retries failed steps up to `retries` times without delay.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.retry_policy = RetryPolicy::immediate(retries);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &SequentialConfig {
        &self.config
    }

    /// Appends a step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DuplicateStep`] if the name is taken.
    pub fn add_step<S: WorkflowStep + 'static>(&mut self, step: S) -> Result<(), WorkflowError> {
        self.base.add_step(Arc::new(step))
    }

    /// Builder form of [`add_step`](SequentialAgent::add_step).
    pub fn with_step<S: WorkflowStep + 'static>(mut self, step: S) -> Result<Self, WorkflowError> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn steps(&self) -> &[Arc<dyn WorkflowStep>] {
        self.base.steps()
    }

    async fn execute_steps(
        &self,
        ctx: &Context,
        input: &Arc<State>,
    ) -> Result<Arc<State>, WorkflowError> {
        let steps = self.base.steps();
        let total = steps.len();
        let mut current = WorkflowState::new(input.clone());

        for (index, step) in steps.iter().enumerate() {
            self.base.wait_while_paused(ctx).await?;
            if let Some(e) = ctx.err() {
                return Err(e);
            }

            let name = step.name();
            self.base.emit(
                EventType::WorkflowStep,
                json!({ "step": name, "index": index, "total": total }),
            );

            match self
                .base
                .run_step(ctx, step, &name, &current, &self.config.retry_policy)
                .await
            {
                Ok(output) => {
                    current = output;
                    self.base.emit(
                        EventType::Progress,
                        json!({
                            "step": name,
                            "index": index + 1,
                            "total": total,
                            "complete": true,
                        }),
                    );
                }
                Err(e) if self.config.stop_on_error || ctx.is_done() => {
                    return Err(WorkflowError::StepFailed {
                        step_name: name,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        workflow = %self.base.name(),
                        step = %name,
                        error = %e,
                        "Step failed, continuing with the last successful state"
                    );
                }
            }
        }

        Ok(current.into_state())
    }
}

#[async_trait]
impl Workflow for SequentialAgent {
    fn base(&self) -> &BaseWorkflowAgent {
        &self.base
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        self.base.validate()
    }

    async fn run(&self, ctx: &Context, input: Arc<State>) -> Result<Arc<State>, WorkflowError> {
        Workflow::validate(self).map_err(WorkflowError::invalid)?;

        let steps = self.base.steps();
        let names = steps.iter().map(|step| step.name()).collect();
        let ctx = self
            .base
            .begin_run(ctx, &input, names, json!({ "steps": steps.len() }))
            .await;

        let result = self.execute_steps(&ctx, &input).await;
        self.base.finish_run(&ctx, &input, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_fn::FnStep;
    use hataori_core::{RunState, StepState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setter(name: &'static str, value: &'static str) -> FnStep {
        FnStep::from_fn(name, move |input: &WorkflowState| {
            let state = input.state().as_ref().clone();
            state.set("response", value);
            state.set(name, true);
            Ok(input.with_state(Arc::new(state)))
        })
    }

    fn failing(name: &'static str) -> FnStep {
        FnStep::from_fn(name, move |_: &WorkflowState| {
            Err(WorkflowError::step(name, "intentional failure"))
        })
    }

    #[tokio::test]
    async fn test_threads_state_in_order() {
        let agent = SequentialAgent::new("seq")
            .with_step(setter("a", "first"))
            .unwrap()
            .with_step(setter("b", "second"))
            .unwrap();

        let output = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(output.get_as::<String>("response").as_deref(), Some("second"));
        assert!(output.has("a"));
        assert!(output.has("b"));
        assert_eq!(agent.status().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_validation_failure_runs_nothing() {
        let agent = SequentialAgent::new("empty");
        let result = agent.run(&Context::new(), State::new().shared()).await;
        assert!(matches!(result, Err(WorkflowError::Validation(_))));
        assert_eq!(agent.status().state, RunState::Pending);
    }

    #[tokio::test]
    async fn test_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnStep::from_fn("flaky", move |input: &WorkflowState| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(WorkflowError::step("flaky", "not yet"));
            }
            Ok(input.clone())
        });

        let agent = SequentialAgent::new("retrying")
            .with_max_retries(2)
            .with_step(flaky)
            .unwrap();

        agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(agent.status().step("flaky").unwrap().retries, 2);
    }

    #[tokio::test]
    async fn test_error_is_wrapped_with_step_name() {
        let agent = SequentialAgent::new("seq")
            .with_step(failing("broken"))
            .unwrap();

        let err = agent
            .run(&Context::new(), State::new().shared())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("step broken failed"));
        let status = agent.status();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.step_state("broken"), Some(StepState::Failed));
        assert!(status.end_time.is_some());
    }

    #[tokio::test]
    async fn test_canceled_context_marks_canceled() {
        let agent = SequentialAgent::new("seq")
            .with_step(setter("a", "x"))
            .unwrap();
        let ctx = Context::new();
        ctx.cancel();

        let err = agent.run(&ctx, State::new().shared()).await.unwrap_err();

        assert!(err.is_cancellation());
        let status = agent.status();
        assert_eq!(status.state, RunState::Canceled);
        assert_eq!(status.step_state("a"), Some(StepState::Pending));
    }
}
