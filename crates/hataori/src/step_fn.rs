//! Steps built from closures.

use async_trait::async_trait;
use hataori_core::{Context, StepName, WorkflowError, WorkflowState, WorkflowStep};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type StepFuture = Pin<Box<dyn Future<Output = Result<WorkflowState, WorkflowError>> + Send>>;
type StepFn = Arc<dyn Fn(Context, WorkflowState) -> StepFuture + Send + Sync>;

/// A named step backed by a closure.
///
/// # Examples
///
/// ```
/// use hataori::prelude::*;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let fetch = FnStep::new("fetch", |ctx: Context, input: WorkflowState| async move {
///     ctx.sleep(Duration::from_millis(1)).await?;
///     let state = input.state().as_ref().clone();
///     state.set("result", "fetched");
///     Ok(input.with_state(Arc::new(state)))
/// });
/// assert_eq!(WorkflowStep::name(&fetch).as_str(), "fetch");
/// ```
#[derive(Clone)]
pub struct FnStep {
    name: StepName,
    func: StepFn,
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl FnStep {
    /// Creates a step from an async closure.
    pub fn new<F, Fut>(name: impl Into<StepName>, func: F) -> Self
    where
        F: Fn(Context, WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowState, WorkflowError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |ctx: Context, state: WorkflowState| -> StepFuture {
                Box::pin(func(ctx, state))
            }),
        }
    }

    /// Creates a step from a synchronous closure.
    pub fn from_fn<F>(name: impl Into<StepName>, func: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<WorkflowState, WorkflowError> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(name, move |_ctx, state| {
            let func = func.clone();
            async move { func(&state) }
        })
    }
}

#[async_trait]
impl WorkflowStep for FnStep {
    fn name(&self) -> StepName {
        self.name.clone()
    }

    async fn execute(
        &self,
        ctx: &Context,
        state: &WorkflowState,
    ) -> Result<WorkflowState, WorkflowError> {
        (self.func)(ctx.clone(), state.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hataori_core::State;

    #[tokio::test]
    async fn test_sync_step() {
        let step = FnStep::from_fn("double", |input: &WorkflowState| {
            let value = input.state().get_as::<i64>("n").unwrap_or_default();
            let state = input.state().as_ref().clone();
            state.set("n", value * 2);
            Ok(input.with_state(Arc::new(state)))
        });

        let input = WorkflowState::from(State::with_values([("n", 21)]));
        let output = step.execute(&Context::new(), &input).await.unwrap();

        assert_eq!(output.state().get_as::<i64>("n"), Some(42));
        assert_eq!(input.state().get_as::<i64>("n"), Some(21));
    }

    #[tokio::test]
    async fn test_async_step_sees_context() {
        let step = FnStep::new("watch", |ctx: Context, input: WorkflowState| async move {
            match ctx.err() {
                Some(e) => Err(e),
                None => Ok(input),
            }
        });

        let ctx = Context::new();
        ctx.cancel();
        let result = step
            .execute(&ctx, &WorkflowState::from(State::new()))
            .await;
        assert!(matches!(result, Err(WorkflowError::Canceled)));
    }
}
