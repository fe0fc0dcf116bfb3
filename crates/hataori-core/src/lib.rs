//! Core traits and types for the hataori workflow engine.
//!
//! This crate holds the vocabulary shared by the engine and by step
//! implementations. Library authors should depend on this crate to
//! implement custom steps, error handlers and hooks.
//!
//! # Core Types
//!
//! - [`State`] - Versioned, thread-safe data passed between steps
//! - [`WorkflowStep`] - The trait every executable unit implements
//! - [`Context`] - Cooperative cancellation and deadlines
//! - [`WorkflowError`] - Error types for workflow execution
//!
//! # Plug-in Points
//!
//! - [`ErrorHandler`] - Decide between retry, skip, abort and continue
//! - [`Hook`] - Callbacks before and after each run
//! - [`Event`] - Records emitted while a workflow runs

mod artifact;
mod context;
mod error;
mod event;
mod message;
mod retry;
mod state;
mod status;
mod step;
mod traits;

pub use artifact::{Artifact, ArtifactContent, ArtifactType};
pub use context::Context;
pub use error::{HookType, WorkflowError};
pub use event::{
    combine_filters, filter_by_agent, filter_by_agent_name, filter_by_type, filter_errors, Event,
    EventFilter, EventType,
};
pub use message::{Message, Role};
pub use retry::{RetryPolicy, RetryPolicyError};
pub use state::{State, StateSnapshot};
pub use status::{RunState, StepState, StepStatus, WorkflowStatus};
pub use step::{StepName, WorkflowState, WorkflowStep};
pub use traits::{DefaultErrorHandler, ErrorAction, ErrorHandler, Hook, WorkflowInfo, WorkflowKind};

/// Dynamically typed value stored in a [`State`].
pub use serde_json::Value;
