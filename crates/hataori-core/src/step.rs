//! Step trait and related types.

use crate::context::Context;
use crate::error::WorkflowError;
use crate::state::State;
use crate::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for StepName {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

impl serde::Serialize for StepName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The unit of data a step consumes and produces.
///
/// Wraps a shared [`State`] together with per-run metadata. Cloning is
/// cheap: the state itself is shared, not copied. A step that wants its
/// own copy of the data calls `State::clone` on
/// [`state()`](WorkflowState::state).
#[derive(Debug, Clone)]
pub struct WorkflowState {
    state: Arc<State>,
    metadata: HashMap<String, Value>,
}

impl WorkflowState {
    pub fn new(state: Arc<State>) -> Self {
        Self {
            state,
            metadata: HashMap::new(),
        }
    }

    /// Returns the wrapped state.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Consumes the wrapper and returns the state.
    pub fn into_state(self) -> Arc<State> {
        self.state
    }

    /// Returns a copy of the wrapper pointing at another state, keeping
    /// the run metadata.
    pub fn with_state(&self, state: Arc<State>) -> Self {
        Self {
            state,
            metadata: self.metadata.clone(),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn all_metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }
}

impl From<Arc<State>> for WorkflowState {
    fn from(state: Arc<State>) -> Self {
        Self::new(state)
    }
}

impl From<State> for WorkflowState {
    fn from(state: State) -> Self {
        Self::new(Arc::new(state))
    }
}

/// An executable unit of a workflow.
///
/// Every agent, tool wrapper or nested workflow the engine runs
/// implements this trait. A step receives the current state and returns
/// a new one; it must not assume exclusive access to the input, since
/// parallel workflows hand the same input to every step.
///
/// Cancellation is cooperative: long-running steps should watch
/// [`Context::done`] or poll [`Context::is_done`].
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use hataori_core::{Context, StepName, WorkflowError, WorkflowState, WorkflowStep};
///
/// #[derive(Debug)]
/// struct Summarize;
///
/// #[async_trait]
/// impl WorkflowStep for Summarize {
///     fn name(&self) -> StepName {
///         StepName::new("summarize")
///     }
///
///     async fn execute(
///         &self,
///         _ctx: &Context,
///         input: &WorkflowState,
///     ) -> Result<WorkflowState, WorkflowError> {
///         let state = input.state().as_ref().clone();
///         state.set("response", "short summary");
///         Ok(input.with_state(state.into()))
///     }
/// }
/// ```
#[async_trait]
pub trait WorkflowStep: Send + Sync + Debug {
    /// Returns the step name. Names are unique within a workflow.
    fn name(&self) -> StepName;

    /// Executes the step logic.
    async fn execute(
        &self,
        ctx: &Context,
        state: &WorkflowState,
    ) -> Result<WorkflowState, WorkflowError>;

    /// Checks the step configuration before a run.
    fn validate(&self) -> Result<(), WorkflowError> {
        Ok(())
    }
}

#[async_trait]
impl<T: WorkflowStep + ?Sized> WorkflowStep for Arc<T> {
    fn name(&self) -> StepName {
        (**self).name()
    }

    async fn execute(
        &self,
        ctx: &Context,
        state: &WorkflowState,
    ) -> Result<WorkflowState, WorkflowError> {
        (**self).execute(ctx, state).await
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        (**self).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name.as_str(), "test");
        assert!(StepName::new("").is_empty());
    }

    #[test]
    fn test_workflow_state_shares_state() {
        let state = Arc::new(State::new());
        let mut wrapped = WorkflowState::new(state.clone());
        wrapped.set_metadata("run", 1);

        let copy = wrapped.clone();
        copy.state().set("key", "value");

        assert_eq!(state.get_as::<String>("key").as_deref(), Some("value"));
        assert_eq!(copy.metadata("run"), Some(&Value::from(1)));
    }

    #[test]
    fn test_with_state_keeps_metadata() {
        let mut wrapped = WorkflowState::from(State::new());
        wrapped.set_metadata("trace", "abc");

        let replaced = wrapped.with_state(Arc::new(State::new()));
        assert!(!Arc::ptr_eq(replaced.state(), wrapped.state()));
        assert_eq!(replaced.metadata("trace"), Some(&Value::from("abc")));
    }
}
