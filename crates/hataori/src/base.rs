//! Scaffolding shared by every workflow agent.

use crate::events::{EventEmitter, SubscriptionId};
use chrono::Utc;
use hataori_core::{
    Context, ErrorAction, ErrorHandler, Event, EventFilter, EventType, Hook, HookType, RetryPolicy,
    RunState, State, StepName, StepState, StepStatus, Value, WorkflowError, WorkflowInfo,
    WorkflowKind, WorkflowState, WorkflowStatus, WorkflowStep,
};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status bookkeeping and event emission for one agent.
///
/// Cheap to clone, so that tasks spawned by a run can report progress
/// without borrowing the agent.
#[derive(Clone)]
pub(crate) struct RunTracker {
    id: Arc<str>,
    name: Arc<str>,
    status: Arc<Mutex<WorkflowStatus>>,
    events: Arc<EventEmitter>,
}

impl RunTracker {
    fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: Arc::new(Mutex::new(WorkflowStatus::default())),
            events: Arc::new(EventEmitter::new()),
        }
    }

    pub(crate) fn emit(&self, event_type: EventType, data: Value) {
        self.events
            .emit(&Event::new(event_type, &*self.id, &*self.name, data));
    }

    pub(crate) fn emit_error(&self, data: Value, error: &WorkflowError) {
        self.events.emit(
            &Event::new(EventType::AgentError, &*self.id, &*self.name, data).with_error(error),
        );
    }

    pub(crate) fn status(&self) -> WorkflowStatus {
        self.status.lock().clone()
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.status.lock().state = state;
    }

    /// Records a non-fatal error on a run that may still complete.
    pub(crate) fn set_run_error(&self, error: &WorkflowError) {
        self.status.lock().error = Some(error.to_string());
    }

    pub(crate) fn step_started(&self, name: &StepName) {
        let mut status = self.status.lock();
        status.current_step = Some(name.clone());
        let step = status.steps.entry(name.clone()).or_default();
        step.state = StepState::Running;
        step.start_time = Some(Utc::now());
        step.end_time = None;
        step.error = None;
    }

    pub(crate) fn step_retried(&self, name: &StepName) {
        let mut status = self.status.lock();
        status.steps.entry(name.clone()).or_default().retries += 1;
    }

    pub(crate) fn step_finished(
        &self,
        name: &StepName,
        state: StepState,
        error: Option<&WorkflowError>,
    ) {
        let mut status = self.status.lock();
        let step = status.steps.entry(name.clone()).or_default();
        step.state = state;
        step.end_time = Some(Utc::now());
        step.error = error.map(ToString::to_string);
    }
}

/// How a failed step was recovered by the error handler.
pub(crate) enum Recovery {
    /// The retry succeeded.
    Recovered(WorkflowState),
    /// The failure is ignored; carries the step's input.
    Skipped(WorkflowState),
}

/// The runtime every agent embeds: step registry, status, hooks, error
/// handler, events, and pause and cancel controls.
pub struct BaseWorkflowAgent {
    id: String,
    name: String,
    description: String,
    kind: WorkflowKind,
    steps: Vec<Arc<dyn WorkflowStep>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    hooks: Vec<Arc<dyn Hook>>,
    tracker: RunTracker,
    paused: watch::Sender<bool>,
    active_run: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for BaseWorkflowAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseWorkflowAgent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("hooks", &self.hooks.len())
            .field("state", &self.tracker.status.lock().state)
            .finish_non_exhaustive()
    }
}

impl BaseWorkflowAgent {
    pub fn new(name: impl Into<String>, kind: WorkflowKind) -> Self {
        let name = name.into();
        let id = Uuid::new_v4().to_string();
        let (paused, _) = watch::channel(false);
        Self {
            tracker: RunTracker::new(&id, &name),
            description: format!("{kind} workflow: {name}"),
            id,
            name,
            kind,
            steps: Vec::new(),
            error_handler: None,
            hooks: Vec::new(),
            paused,
            active_run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
        }
    }

    /// Registers a step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DuplicateStep`] if a step with the same
    /// name is already registered.
    pub fn add_step(&mut self, step: Arc<dyn WorkflowStep>) -> Result<(), WorkflowError> {
        let name = step.name();
        if self.steps.iter().any(|existing| existing.name() == name) {
            return Err(WorkflowError::DuplicateStep(name));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn steps(&self) -> &[Arc<dyn WorkflowStep>] {
        &self.steps
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    pub fn add_hook(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Checks the agent name.
    pub fn validate_name(&self) -> Result<(), WorkflowError> {
        if self.name.is_empty() {
            return Err(WorkflowError::configuration("workflow name is required"));
        }
        Ok(())
    }

    /// Checks the agent name and the registered steps.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.validate_name()?;
        if self.steps.is_empty() {
            return Err(WorkflowError::configuration(
                "workflow must have at least one step",
            ));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let name = step.name();
            if name.is_empty() {
                return Err(WorkflowError::configuration(format!(
                    "step {index} has empty name"
                )));
            }
            step.validate().map_err(|e| {
                WorkflowError::configuration(format!("step {name} validation failed: {e}"))
            })?;
        }
        Ok(())
    }

    /// Returns a copy of the current status.
    pub fn status(&self) -> WorkflowStatus {
        self.tracker.status()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.tracker.events
    }

    pub fn on_event<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.tracker.events.on_event(handler)
    }

    pub fn subscribe<F>(
        &self,
        handler: F,
        filters: impl IntoIterator<Item = EventFilter>,
    ) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.tracker.events.subscribe(handler, filters)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.tracker.events.unsubscribe(id)
    }

    /// Holds the run at the next step or iteration boundary.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Cancels the active run. Returns `false` if nothing is running.
    pub fn cancel(&self) -> bool {
        match self.active_run.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub(crate) fn emit(&self, event_type: EventType, data: Value) {
        self.tracker.emit(event_type, data);
    }

    /// Starts a run: resets the status, marks `steps` pending, emits the
    /// start event and notifies hooks. Returns the run's own context.
    pub(crate) async fn begin_run(
        &self,
        ctx: &Context,
        input: &State,
        steps: Vec<StepName>,
        data: Value,
    ) -> Context {
        let run_ctx = ctx.child();
        *self.active_run.lock() = Some(run_ctx.token().clone());

        *self.tracker.status.lock() = WorkflowStatus {
            state: RunState::Running,
            start_time: Some(Utc::now()),
            steps: steps
                .into_iter()
                .map(|name| (name, StepStatus::default()))
                .collect(),
            ..WorkflowStatus::default()
        };

        info!(workflow = %self.name, kind = %self.kind, "Workflow started");
        self.emit(EventType::WorkflowStart, data);

        let info = self.info();
        for hook in &self.hooks {
            if let Err(e) = hook.before_run(&run_ctx, &info, input).await {
                self.log_hook_failure(HookType::BeforeRun, &e);
            }
        }
        run_ctx
    }

    /// Ends a run: records the terminal status, notifies hooks and emits
    /// the completion or error event. Returns `result` unchanged.
    pub(crate) async fn finish_run(
        &self,
        ctx: &Context,
        input: &State,
        result: Result<Arc<State>, WorkflowError>,
    ) -> Result<Arc<State>, WorkflowError> {
        let summary = {
            let mut status = self.tracker.status.lock();
            let now = Utc::now();
            status.end_time = Some(now);
            match &result {
                Ok(_) => {
                    status.state = RunState::Completed;
                    status.current_step = None;
                }
                Err(e) => {
                    status.state = if e.is_cancellation() {
                        RunState::Canceled
                    } else {
                        RunState::Failed
                    };
                    status.error = Some(e.to_string());
                }
            }
            let count = |state: StepState| {
                status
                    .steps
                    .values()
                    .filter(|step| step.state == state)
                    .count()
            };
            let duration_ms = status
                .start_time
                .map(|start| (now - start).num_milliseconds())
                .unwrap_or_default();
            json!({
                "duration_ms": duration_ms,
                "state": status.state,
                "steps": status.steps.len(),
                "completed": count(StepState::Completed),
                "failed": count(StepState::Failed),
                "skipped": count(StepState::Skipped),
            })
        };

        let info = self.info();
        let (output, error) = match &result {
            Ok(state) => (Some(state.as_ref()), None),
            Err(e) => (None, Some(e)),
        };
        for hook in &self.hooks {
            if let Err(e) = hook.after_run(ctx, &info, input, output, error).await {
                self.log_hook_failure(HookType::AfterRun, &e);
            }
        }

        match &result {
            Ok(_) => {
                info!(workflow = %self.name, "Workflow completed");
                self.emit(EventType::AgentComplete, summary);
            }
            Err(e) if e.is_cancellation() => {
                info!(workflow = %self.name, error = %e, "Workflow canceled");
                self.tracker.emit_error(summary, e);
            }
            Err(e) => {
                warn!(workflow = %self.name, error = %e, "Workflow failed");
                self.tracker.emit_error(summary, e);
            }
        }

        self.active_run.lock().take();
        result
    }

    fn log_hook_failure(&self, hook_type: HookType, error: &WorkflowError) {
        let error = WorkflowError::HookError {
            workflow: self.name.clone(),
            hook_type,
            details: error.to_string(),
        };
        warn!("{error}");
    }

    /// Waits while the agent is paused. Status reads `paused` meanwhile.
    pub(crate) async fn wait_while_paused(&self, ctx: &Context) -> Result<(), WorkflowError> {
        let mut paused = self.paused.subscribe();
        if !*paused.borrow_and_update() {
            return Ok(());
        }

        self.tracker.set_run_state(RunState::Paused);
        info!(workflow = %self.name, "Workflow paused");
        self.emit(EventType::Progress, json!({ "paused": true }));

        let resumed = tokio::select! {
            changed = paused.wait_for(|paused| !*paused) => {
                changed.map(|_| ()).map_err(|_| WorkflowError::Canceled)
            }
            _ = ctx.done() => Err(ctx.err().unwrap_or(WorkflowError::Canceled)),
        };

        if resumed.is_ok() {
            self.tracker.set_run_state(RunState::Running);
            info!(workflow = %self.name, "Workflow resumed");
            self.emit(EventType::Progress, json!({ "resumed": true }));
        }
        resumed
    }

    /// Delegates a step failure to the error handler.
    ///
    /// Without a handler the error is returned unchanged.
    pub(crate) async fn handle_step_error(
        &self,
        ctx: &Context,
        step: &Arc<dyn WorkflowStep>,
        name: &StepName,
        state: &WorkflowState,
        error: WorkflowError,
    ) -> Result<Recovery, WorkflowError> {
        let Some(handler) = &self.error_handler else {
            return Err(error);
        };
        match handler.handle_error(ctx, step.as_ref(), state, &error) {
            ErrorAction::Retry => {
                debug!(step = %name, error = %error, "Error handler requested retry");
                self.tracker.step_retried(name);
                step.execute(ctx, state).await.map(Recovery::Recovered)
            }
            ErrorAction::Skip => {
                debug!(step = %name, error = %error, "Error handler skipped step");
                Ok(Recovery::Skipped(state.clone()))
            }
            ErrorAction::Abort => Err(WorkflowError::Aborted {
                source: Box::new(error),
            }),
            ErrorAction::Continue => Err(error),
        }
    }

    /// Runs one step with status bookkeeping, the retry policy and the
    /// error handler.
    ///
    /// The step is attempted up to `retry.max_attempts()` times. Each
    /// failure goes through the error handler first; an abort or a
    /// finished context ends the attempts early. Retry delays end early
    /// when the context does.
    pub(crate) async fn run_step(
        &self,
        ctx: &Context,
        step: &Arc<dyn WorkflowStep>,
        name: &StepName,
        input: &WorkflowState,
        retry: &RetryPolicy,
    ) -> Result<WorkflowState, WorkflowError> {
        self.tracker.step_started(name);

        let max_retries = retry.max_retries();
        let mut attempt = 0;
        let outcome = loop {
            if attempt > 0 {
                if let Some(delay) = retry.delay_for_attempt(attempt - 1) {
                    if let Err(e) = ctx.sleep(delay).await {
                        break Err(e);
                    }
                }
                info!(
                    "Step '{}' failed, retrying ({}/{})",
                    name, attempt, max_retries
                );
                self.tracker.step_retried(name);
                self.emit(
                    EventType::Progress,
                    json!({
                        "step": name,
                        "retry": attempt,
                        "message": format!(
                            "Retrying step {name} (attempt {attempt}/{max_retries})"
                        ),
                    }),
                );
            }

            let error = match step.execute(ctx, input).await {
                Ok(output) => break Ok((output, StepState::Completed)),
                Err(e) => e,
            };
            match self.handle_step_error(ctx, step, name, input, error).await {
                Ok(Recovery::Recovered(output)) => break Ok((output, StepState::Completed)),
                Ok(Recovery::Skipped(output)) => break Ok((output, StepState::Skipped)),
                Err(e) => {
                    let aborted = matches!(e, WorkflowError::Aborted { .. });
                    if aborted || attempt >= max_retries || ctx.is_done() {
                        if attempt > 0 {
                            warn!("Step '{}' failed after {} retries", name, attempt);
                        }
                        break Err(e);
                    }
                    attempt += 1;
                }
            }
        };

        match outcome {
            Ok((output, state)) => {
                info!("Step '{}' {}", name, state);
                self.tracker.step_finished(name, state, None);
                Ok(output)
            }
            Err(e) => {
                self.tracker.step_finished(name, StepState::Failed, Some(&e));
                self.tracker
                    .emit_error(json!({ "step": name, "error": e.to_string() }), &e);
                Err(e)
            }
        }
    }
}
