//! Workflow error types.

use crate::step::StepName;
use thiserror::Error;

/// The workflow hook callback that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// The `before_run` callback.
    BeforeRun,
    /// The `after_run` callback.
    AfterRun,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::BeforeRun => write!(f, "before_run"),
            HookType::AfterRun => write!(f, "after_run"),
        }
    }
}

/// Errors that can occur while validating or running a workflow.
///
/// Errors raised by a step are wrapped with the identifier of the step,
/// branch or iteration that produced them before they leave a workflow,
/// so the chain reads from the outermost workflow down to the step.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step failed during execution.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// A step with the same name is already registered.
    #[error("step with name {0} already exists")]
    DuplicateStep(StepName),

    /// Validation failed before the run started.
    #[error("workflow validation failed: {0}")]
    Validation(#[source] Box<WorkflowError>),

    /// A workflow hook failed. Hook failures are logged, never propagated.
    #[error("Hook '{hook_type}' failed in workflow '{workflow}': {details}")]
    HookError {
        /// The name of the workflow whose hook failed.
        workflow: String,
        /// Which callback failed.
        hook_type: HookType,
        /// Details about the failure.
        details: String,
    },

    /// A sequential step failed and stopped the run.
    #[error("step {step_name} failed: {source}")]
    StepFailed {
        /// The failing step.
        step_name: StepName,
        /// The underlying error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// A conditional branch failed.
    #[error("branch {branch} failed: {source}")]
    BranchFailed {
        /// The failing branch.
        branch: String,
        /// The underlying error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// The default branch of a conditional workflow failed.
    #[error("default branch failed: {source}")]
    DefaultBranchFailed {
        /// The underlying error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// A loop body failed with break-on-error enabled.
    #[error("loop failed at iteration {iteration}: {source}")]
    IterationFailed {
        /// Zero-based iteration index.
        iteration: u32,
        /// The underlying error.
        #[source]
        source: Box<WorkflowError>,
    },

    /// The error handler decided to abort the workflow.
    #[error("workflow aborted due to step error: {source}")]
    Aborted {
        /// The step error that triggered the abort.
        #[source]
        source: Box<WorkflowError>,
    },

    /// No parallel step succeeded.
    #[error("parallel execution failed: {failed} steps failed")]
    ParallelFailed {
        /// Number of failed steps.
        failed: usize,
    },

    /// Some parallel steps failed but the merge tolerated it.
    #[error("completed with {failed} errors")]
    PartialFailure {
        /// Number of failed steps.
        failed: usize,
    },

    /// `MergeStrategy::Custom` was selected without a merge function.
    #[error("merge function not set for custom merge strategy")]
    MissingMergeFunction,

    /// The context was canceled.
    #[error("workflow canceled")]
    Canceled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl WorkflowError {
    /// Creates a [`WorkflowError::StepError`].
    pub fn step(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        WorkflowError::StepError {
            step_name: step_name.into(),
            details: details.into(),
        }
    }

    /// Creates a [`WorkflowError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        WorkflowError::Configuration(message.into())
    }

    /// Wraps a validation failure returned by `validate`.
    pub fn invalid(source: WorkflowError) -> Self {
        WorkflowError::Validation(Box::new(source))
    }

    /// Returns the directly wrapped error, if any.
    pub fn inner(&self) -> Option<&WorkflowError> {
        match self {
            WorkflowError::Validation(source)
            | WorkflowError::StepFailed { source, .. }
            | WorkflowError::BranchFailed { source, .. }
            | WorkflowError::DefaultBranchFailed { source }
            | WorkflowError::IterationFailed { source, .. }
            | WorkflowError::Aborted { source } => Some(source),
            _ => None,
        }
    }

    /// Returns the innermost error of the wrapping chain.
    pub fn root_cause(&self) -> &WorkflowError {
        let mut current = self;
        while let Some(inner) = current.inner() {
            current = inner;
        }
        current
    }

    /// Returns `true` if the chain ends in a cancellation or a deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.root_cause(),
            WorkflowError::Canceled | WorkflowError::DeadlineExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::step("test_step", "test error");
        assert_eq!(
            error.to_string(),
            "Step failed: test_step, details: test error"
        );
    }

    #[test]
    fn test_wrapped_error_display() {
        let error = WorkflowError::StepFailed {
            step_name: StepName::new("B"),
            source: Box::new(WorkflowError::step("B", "boom")),
        };
        assert_eq!(
            error.to_string(),
            "step B failed: Step failed: B, details: boom"
        );

        let error = WorkflowError::IterationFailed {
            iteration: 2,
            source: Box::new(WorkflowError::step("body", "boom")),
        };
        assert!(error.to_string().starts_with("loop failed at iteration 2"));
    }

    #[test]
    fn test_cancellation_detection_walks_chain() {
        let error = WorkflowError::StepFailed {
            step_name: StepName::new("A"),
            source: Box::new(WorkflowError::Aborted {
                source: Box::new(WorkflowError::DeadlineExceeded),
            }),
        };
        assert!(error.is_cancellation());
        assert!(matches!(
            error.root_cause(),
            WorkflowError::DeadlineExceeded
        ));
        assert!(!WorkflowError::step("A", "x").is_cancellation());
    }

    #[test]
    fn test_hook_type_display() {
        assert_eq!(HookType::BeforeRun.to_string(), "before_run");
        assert_eq!(HookType::AfterRun.to_string(), "after_run");
    }
}
