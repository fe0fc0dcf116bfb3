//! Plug-in points around workflow execution: error handlers and hooks.

use crate::context::Context;
use crate::error::WorkflowError;
use crate::state::State;
use crate::step::{WorkflowState, WorkflowStep};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// What a workflow should do after a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorAction {
    /// Execute the step once more.
    Retry,
    /// Ignore the failure and keep the input state.
    Skip,
    /// Stop the whole workflow.
    Abort,
    /// Hand the error back to the workflow's own error policy.
    Continue,
}

/// Decides how a workflow reacts to a failed step.
///
/// # Examples
///
/// ```
/// use hataori_core::{
///     Context, ErrorAction, ErrorHandler, WorkflowError, WorkflowState, WorkflowStep,
/// };
///
/// struct SkipOptional;
///
/// impl ErrorHandler for SkipOptional {
///     fn handle_error(
///         &self,
///         _ctx: &Context,
///         step: &dyn WorkflowStep,
///         _state: &WorkflowState,
///         _error: &WorkflowError,
///     ) -> ErrorAction {
///         if step.name().as_str().starts_with("optional") {
///             ErrorAction::Skip
///         } else {
///             ErrorAction::Abort
///         }
///     }
/// }
/// ```
pub trait ErrorHandler: Send + Sync {
    fn handle_error(
        &self,
        ctx: &Context,
        step: &dyn WorkflowStep,
        state: &WorkflowState,
        error: &WorkflowError,
    ) -> ErrorAction;
}

/// Error handler that aborts on every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(
        &self,
        _ctx: &Context,
        _step: &dyn WorkflowStep,
        _state: &WorkflowState,
        _error: &WorkflowError,
    ) -> ErrorAction {
        ErrorAction::Abort
    }
}

/// Execution strategy of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Sequential,
    Parallel,
    Conditional,
    Loop,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            WorkflowKind::Sequential => "sequential",
            WorkflowKind::Parallel => "parallel",
            WorkflowKind::Conditional => "conditional",
            WorkflowKind::Loop => "loop",
        };
        f.write_str(kind)
    }
}

/// Identity of the workflow a hook is called for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowInfo {
    pub id: String,
    pub name: String,
    pub kind: WorkflowKind,
}

/// Callbacks around a workflow run.
///
/// Hook failures are logged by the engine and never change the outcome
/// of the run.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Called after validation, before the first step runs.
    async fn before_run(
        &self,
        _ctx: &Context,
        _workflow: &WorkflowInfo,
        _input: &State,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Called once the run finished, successfully or not.
    async fn after_run(
        &self,
        _ctx: &Context,
        _workflow: &WorkflowInfo,
        _input: &State,
        _result: Option<&State>,
        _error: Option<&WorkflowError>,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepName;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl WorkflowStep for Noop {
        fn name(&self) -> StepName {
            StepName::new("noop")
        }

        async fn execute(
            &self,
            _ctx: &Context,
            state: &WorkflowState,
        ) -> Result<WorkflowState, WorkflowError> {
            Ok(state.clone())
        }
    }

    #[test]
    fn test_default_handler_aborts() {
        let action = DefaultErrorHandler.handle_error(
            &Context::new(),
            &Noop,
            &WorkflowState::from(State::new()),
            &WorkflowError::step("noop", "boom"),
        );
        assert_eq!(action, ErrorAction::Abort);
    }

    #[tokio::test]
    async fn test_hook_defaults_are_ok() {
        struct Silent;
        impl Hook for Silent {}

        let info = WorkflowInfo {
            id: "1".into(),
            name: "wf".into(),
            kind: WorkflowKind::Loop,
        };
        let state = State::new();
        assert!(Silent
            .before_run(&Context::new(), &info, &state)
            .await
            .is_ok());
        assert!(Silent
            .after_run(&Context::new(), &info, &state, None, None)
            .await
            .is_ok());
        assert_eq!(info.kind.to_string(), "loop");
    }
}
