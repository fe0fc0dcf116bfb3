//! Bundled [`Hook`] implementations.

use async_trait::async_trait;
use hataori_core::{Context, Hook, State, WorkflowError, WorkflowInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Level};

/// Logs every run start and finish through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHook {
    level: Level,
}

impl Default for LoggingHook {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level used for start and success messages. Failures are always
    /// logged at `WARN`.
    pub fn with_level(level: Level) -> Self {
        Self { level }
    }

    fn log(&self, message: &str, workflow: &WorkflowInfo, version: u64) {
        let (name, kind) = (workflow.name.as_str(), workflow.kind);
        match self.level {
            Level::ERROR => error!(workflow = name, %kind, version, "{message}"),
            Level::WARN => warn!(workflow = name, %kind, version, "{message}"),
            Level::INFO => info!(workflow = name, %kind, version, "{message}"),
            Level::DEBUG => debug!(workflow = name, %kind, version, "{message}"),
            _ => trace!(workflow = name, %kind, version, "{message}"),
        }
    }
}

#[async_trait]
impl Hook for LoggingHook {
    async fn before_run(
        &self,
        _ctx: &Context,
        workflow: &WorkflowInfo,
        input: &State,
    ) -> Result<(), WorkflowError> {
        self.log("Workflow run starting", workflow, input.version());
        Ok(())
    }

    async fn after_run(
        &self,
        _ctx: &Context,
        workflow: &WorkflowInfo,
        _input: &State,
        output: Option<&State>,
        error: Option<&WorkflowError>,
    ) -> Result<(), WorkflowError> {
        match error {
            Some(e) => warn!(
                workflow = %workflow.name,
                kind = %workflow.kind,
                error = %e,
                "Workflow run failed"
            ),
            None => self.log(
                "Workflow run finished",
                workflow,
                output.map_or(0, State::version),
            ),
        }
        Ok(())
    }
}

/// Counters collected by [`MetricsHook`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowMetrics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub total_duration: Duration,
    pub last_duration: Option<Duration>,
}

impl WorkflowMetrics {
    /// Mean duration of finished runs.
    pub fn average_duration(&self) -> Option<Duration> {
        let finished = self.successes + self.failures + self.cancellations;
        let finished = u32::try_from(finished).ok().filter(|n| *n > 0)?;
        Some(self.total_duration / finished)
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    metrics: WorkflowMetrics,
    started: HashMap<String, Instant>,
}

/// Counts runs and their outcomes, and measures their duration.
///
/// One hook may be shared by several workflows; counters are aggregated.
#[derive(Debug, Default)]
pub struct MetricsHook {
    inner: Mutex<MetricsInner>,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the counters.
    pub fn metrics(&self) -> WorkflowMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::default();
    }
}

#[async_trait]
impl Hook for MetricsHook {
    async fn before_run(
        &self,
        _ctx: &Context,
        workflow: &WorkflowInfo,
        _input: &State,
    ) -> Result<(), WorkflowError> {
        let mut inner = self.inner.lock();
        inner.metrics.runs += 1;
        inner.started.insert(workflow.id.clone(), Instant::now());
        Ok(())
    }

    async fn after_run(
        &self,
        _ctx: &Context,
        workflow: &WorkflowInfo,
        _input: &State,
        _output: Option<&State>,
        error: Option<&WorkflowError>,
    ) -> Result<(), WorkflowError> {
        let mut inner = self.inner.lock();
        match error {
            None => inner.metrics.successes += 1,
            Some(e) if e.is_cancellation() => inner.metrics.cancellations += 1,
            Some(_) => inner.metrics.failures += 1,
        }
        if let Some(started) = inner.started.remove(&workflow.id) {
            let duration = started.elapsed();
            inner.metrics.total_duration += duration;
            inner.metrics.last_duration = Some(duration);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hataori_core::WorkflowKind;

    fn info() -> WorkflowInfo {
        WorkflowInfo {
            id: "wf-1".to_string(),
            name: "wf".to_string(),
            kind: WorkflowKind::Sequential,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_hook_counts_outcomes() {
        let hook = MetricsHook::new();
        let ctx = Context::new();
        let state = State::new();

        hook.before_run(&ctx, &info(), &state).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        hook.after_run(&ctx, &info(), &state, Some(&state), None)
            .await
            .unwrap();

        hook.before_run(&ctx, &info(), &state).await.unwrap();
        hook.after_run(&ctx, &info(), &state, None, Some(&WorkflowError::Canceled))
            .await
            .unwrap();

        hook.before_run(&ctx, &info(), &state).await.unwrap();
        hook.after_run(
            &ctx,
            &info(),
            &state,
            None,
            Some(&WorkflowError::step("a", "boom")),
        )
        .await
        .unwrap();

        let metrics = hook.metrics();
        assert_eq!(metrics.runs, 3);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.cancellations, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.total_duration, Duration::from_millis(20));
        assert_eq!(metrics.last_duration, Some(Duration::ZERO));

        hook.reset();
        assert_eq!(hook.metrics(), WorkflowMetrics::default());
    }

    #[tokio::test]
    async fn test_logging_hook_never_fails() {
        let hook = LoggingHook::with_level(Level::DEBUG);
        let ctx = Context::new();
        let state = State::new();

        assert!(hook.before_run(&ctx, &info(), &state).await.is_ok());
        assert!(hook
            .after_run(&ctx, &info(), &state, None, Some(&WorkflowError::Canceled))
            .await
            .is_ok());
    }
}
