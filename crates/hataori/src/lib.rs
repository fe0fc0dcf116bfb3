//! A workflow engine for composing async steps.
//!
//! Steps implement [`WorkflowStep`] and are arranged by one of four agents:
//!
//! - [`SequentialAgent`] - steps in order, each fed the previous output
//! - [`ParallelAgent`] - steps concurrently, results merged
//! - [`ConditionalAgent`] - the branch whose condition matches
//! - [`LoopAgent`] - one body repeated until a termination condition
//!
//! Every agent is itself a [`WorkflowStep`], so workflows nest.
//!
//! # Example
//!
//! ```
//! use hataori::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Greet;
//!
//! #[async_trait]
//! impl WorkflowStep for Greet {
//!     fn name(&self) -> StepName {
//!         StepName::new("greet")
//!     }
//!
//!     async fn execute(
//!         &self,
//!         _ctx: &Context,
//!         input: &WorkflowState,
//!     ) -> Result<WorkflowState, WorkflowError> {
//!         let state = input.state().as_ref().clone();
//!         state.set("response", "hello");
//!         Ok(input.with_state(Arc::new(state)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let workflow = SequentialAgent::new("hello")
//!         .with_step(Greet)
//!         .expect("unique step names");
//!
//!     let output = workflow
//!         .run(&Context::new(), State::new().shared())
//!         .await
//!         .expect("workflow failed");
//!     assert_eq!(output.get_as::<String>("response").as_deref(), Some("hello"));
//! }
//! ```

mod base;
mod conditional;
mod events;
mod hooks;
mod loop_agent;
mod parallel;
mod sequential;
mod step_fn;
mod workflow;

// Re-export core types
pub use hataori_core::*;

pub use base::BaseWorkflowAgent;
pub use conditional::{Condition, ConditionalAgent, ConditionalBranch, ConditionalConfig};
pub use events::{EventEmitter, EventHandler, SubscriptionId};
pub use hooks::{LoggingHook, MetricsHook, WorkflowMetrics};
pub use loop_agent::{IterationResult, LoopAgent, LoopCondition, LoopConfig};
pub use parallel::{MergeFn, MergeStrategy, ParallelAgent, ParallelConfig};
pub use sequential::{SequentialAgent, SequentialConfig};
pub use step_fn::FnStep;
pub use workflow::{run_async, Workflow};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        run_async, ConditionalAgent, Context, ErrorAction, ErrorHandler, Event, EventType,
        FnStep, Hook, LoopAgent, MergeStrategy, ParallelAgent, RetryPolicy, RunState,
        SequentialAgent, State, StepName, StepState, Value, Workflow, WorkflowError,
        WorkflowState, WorkflowStep,
    };
}
