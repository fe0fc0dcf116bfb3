//! The trait shared by all workflow agents.

use crate::base::BaseWorkflowAgent;
use async_trait::async_trait;
use hataori_core::{Context, Event, EventType, State, WorkflowError, WorkflowStatus};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A runnable workflow agent.
///
/// Agents also implement [`WorkflowStep`](hataori_core::WorkflowStep), so
/// a workflow can be used as a step, branch or loop body of another one.
///
/// # Examples
///
/// ```
/// use hataori::prelude::*;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), WorkflowError> {
/// let mut pipeline = SequentialAgent::new("pipeline");
/// pipeline.add_step(FnStep::from_fn("greet", |input: &WorkflowState| {
///     let state = input.state().as_ref().clone();
///     state.set("response", "hello");
///     Ok(input.with_state(Arc::new(state)))
/// }))?;
///
/// let output = pipeline.run(&Context::new(), State::new().shared()).await?;
/// assert_eq!(output.get_as::<String>("response").as_deref(), Some("hello"));
/// assert_eq!(pipeline.status().state, RunState::Completed);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + fmt::Debug {
    /// Returns the shared runtime of the agent.
    fn base(&self) -> &BaseWorkflowAgent;

    /// Checks the configuration. Called by [`run`](Workflow::run) before
    /// anything executes.
    fn validate(&self) -> Result<(), WorkflowError>;

    /// Runs the workflow on `input`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Validation`] if the configuration is
    /// invalid, the context error if the run was canceled, and otherwise
    /// the step error wrapped with the step, branch or iteration that
    /// produced it.
    async fn run(&self, ctx: &Context, input: Arc<State>) -> Result<Arc<State>, WorkflowError>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn id(&self) -> &str {
        self.base().id()
    }

    /// Returns a copy of the current status.
    fn status(&self) -> WorkflowStatus {
        self.base().status()
    }
}

/// Runs `workflow` on a spawned task and streams its events.
///
/// The channel receives every event of the run followed by a final
/// `agent.complete` or `agent.error` event, then closes. Must be called
/// within a Tokio runtime.
///
/// # Errors
///
/// Returns [`WorkflowError::Validation`] without spawning anything if the
/// configuration is invalid.
pub fn run_async<W>(
    workflow: Arc<W>,
    ctx: Context,
    input: Arc<State>,
) -> Result<mpsc::UnboundedReceiver<Event>, WorkflowError>
where
    W: Workflow + 'static,
{
    workflow.validate().map_err(WorkflowError::invalid)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let forward = tx.clone();
    let subscription = workflow.base().on_event(move |event: &Event| {
        // the receiver may be gone; the run goes on regardless
        let _ = forward.send(event.clone());
    });

    tokio::spawn(async move {
        let result = workflow.run(&ctx, input).await;
        let base = workflow.base();
        base.unsubscribe(subscription);

        let event = match &result {
            Ok(state) => Event::new(
                EventType::AgentComplete,
                base.id(),
                base.name(),
                json!({ "result": state.snapshot() }),
            ),
            Err(e) => Event::new(
                EventType::AgentError,
                base.id(),
                base.name(),
                json!({ "error": e.to_string() }),
            )
            .with_error(e),
        };
        if tx.send(event).is_err() {
            debug!(workflow = %base.name(), "Event receiver dropped before the final event");
        }
    });

    Ok(rx)
}

/// Implements [`WorkflowStep`](hataori_core::WorkflowStep) for an agent
/// and adds inherent accessors that shadow the identically named trait
/// methods.
macro_rules! workflow_agent {
    ($agent:ty) => {
        impl $agent {
            pub fn base(&self) -> &$crate::BaseWorkflowAgent {
                &self.base
            }

            pub fn id(&self) -> &str {
                self.base.id()
            }

            pub fn name(&self) -> &str {
                self.base.name()
            }

            pub fn description(&self) -> &str {
                self.base.description()
            }

            /// Checks the configuration without running anything.
            pub fn validate(&self) -> Result<(), hataori_core::WorkflowError> {
                <Self as $crate::Workflow>::validate(self)
            }

            /// Returns a copy of the current status.
            pub fn status(&self) -> hataori_core::WorkflowStatus {
                self.base.status()
            }

            pub fn set_error_handler(
                &mut self,
                handler: std::sync::Arc<dyn hataori_core::ErrorHandler>,
            ) {
                self.base.set_error_handler(handler);
            }

            pub fn with_error_handler(
                mut self,
                handler: std::sync::Arc<dyn hataori_core::ErrorHandler>,
            ) -> Self {
                self.base.set_error_handler(handler);
                self
            }

            pub fn add_hook(&mut self, hook: std::sync::Arc<dyn hataori_core::Hook>) {
                self.base.add_hook(hook);
            }

            pub fn with_hook(mut self, hook: std::sync::Arc<dyn hataori_core::Hook>) -> Self {
                self.base.add_hook(hook);
                self
            }

            pub fn with_description(mut self, description: impl Into<String>) -> Self {
                self.base.set_description(description);
                self
            }

            pub fn on_event<F>(&self, handler: F) -> $crate::SubscriptionId
            where
                F: Fn(&hataori_core::Event) + Send + Sync + 'static,
            {
                self.base.on_event(handler)
            }

            pub fn subscribe<F>(
                &self,
                handler: F,
                filters: impl IntoIterator<Item = hataori_core::EventFilter>,
            ) -> $crate::SubscriptionId
            where
                F: Fn(&hataori_core::Event) + Send + Sync + 'static,
            {
                self.base.subscribe(handler, filters)
            }

            pub fn unsubscribe(&self, id: $crate::SubscriptionId) -> bool {
                self.base.unsubscribe(id)
            }

            pub fn pause(&self) {
                self.base.pause();
            }

            pub fn resume(&self) {
                self.base.resume();
            }

            /// Cancels the active run. Returns `false` if nothing is running.
            pub fn cancel(&self) -> bool {
                self.base.cancel()
            }
        }

        #[async_trait::async_trait]
        impl hataori_core::WorkflowStep for $agent {
            fn name(&self) -> hataori_core::StepName {
                hataori_core::StepName::new(self.base.name())
            }

            async fn execute(
                &self,
                ctx: &hataori_core::Context,
                state: &hataori_core::WorkflowState,
            ) -> Result<hataori_core::WorkflowState, hataori_core::WorkflowError> {
                let output = $crate::Workflow::run(self, ctx, state.state().clone()).await?;
                Ok(state.with_state(output))
            }

            fn validate(&self) -> Result<(), hataori_core::WorkflowError> {
                <Self as $crate::Workflow>::validate(self)
            }
        }
    };
}

pub(crate) use workflow_agent;
