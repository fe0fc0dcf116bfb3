//! Priority-ordered predicate dispatch.

use crate::base::BaseWorkflowAgent;
use crate::workflow::{workflow_agent, Workflow};
use async_trait::async_trait;
use hataori_core::{
    Context, EventType, RetryPolicy, State, StepName, WorkflowError, WorkflowKind, WorkflowState,
    WorkflowStep,
};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Predicate deciding whether a branch runs.
pub type Condition = Arc<dyn Fn(&State) -> bool + Send + Sync>;

const DEFAULT_BRANCH: &str = "default";

/// A step guarded by a condition.
#[derive(Clone)]
pub struct ConditionalBranch {
    pub name: String,
    pub condition: Condition,
    pub step: Arc<dyn WorkflowStep>,
    /// Higher priorities are evaluated first.
    pub priority: i32,
}

impl fmt::Debug for ConditionalBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalBranch")
            .field("name", &self.name)
            .field("step", &self.step.name())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`ConditionalAgent`].
#[derive(Debug, Clone, Default)]
pub struct ConditionalConfig {
    /// Keep evaluating branches after the first match.
    pub evaluate_all_conditions: bool,
    /// Run every matching branch, chaining their states.
    pub allow_multiple_matches: bool,
}

/// Runs the branch whose condition matches the input, or a default.
///
/// Branches are evaluated in descending priority; branches with equal
/// priority keep their registration order. Each condition sees the state
/// produced by the previously executed branch. By default evaluation
/// stops at the first match; with either config flag set, every matching
/// branch runs in turn. The default branch runs only when nothing matched.
///
/// The result state's metadata records `executed_branches`,
/// `total_branches` and `has_default`.
#[derive(Debug)]
pub struct ConditionalAgent {
    base: BaseWorkflowAgent,
    config: ConditionalConfig,
    branches: Vec<ConditionalBranch>,
    default_branch: Option<Arc<dyn WorkflowStep>>,
}

workflow_agent!(ConditionalAgent);

impl ConditionalAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: BaseWorkflowAgent::new(name, WorkflowKind::Conditional),
            config: ConditionalConfig::default(),
            branches: Vec::new(),
            default_branch: None,
        }
    }

    pub fn with_config(mut self, config: ConditionalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evaluate_all_conditions(mut self, evaluate_all: bool) -> Self {
        self.config.evaluate_all_conditions = evaluate_all;
        self
    }

    pub fn with_allow_multiple_matches(mut self, allow: bool) -> Self {
        self.config.allow_multiple_matches = allow;
        self
    }

    pub fn config(&self) -> &ConditionalConfig {
        &self.config
    }

    /// Adds a branch with priority 0.
    pub fn add_branch<F, S>(&mut self, name: impl Into<String>, condition: F, step: S)
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
        S: WorkflowStep + 'static,
    {
        self.add_branch_with_priority(name, condition, step, 0);
    }

    pub fn add_branch_with_priority<F, S>(
        &mut self,
        name: impl Into<String>,
        condition: F,
        step: S,
        priority: i32,
    ) where
        F: Fn(&State) -> bool + Send + Sync + 'static,
        S: WorkflowStep + 'static,
    {
        self.branches.push(ConditionalBranch {
            name: name.into(),
            condition: Arc::new(condition),
            step: Arc::new(step),
            priority,
        });
    }

    /// Builder form of [`add_branch_with_priority`](ConditionalAgent::add_branch_with_priority).
    pub fn with_branch<F, S>(
        mut self,
        name: impl Into<String>,
        condition: F,
        step: S,
        priority: i32,
    ) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
        S: WorkflowStep + 'static,
    {
        self.add_branch_with_priority(name, condition, step, priority);
        self
    }

    /// Sets the step run when no branch matches.
    pub fn set_default_branch<S: WorkflowStep + 'static>(&mut self, step: S) {
        self.default_branch = Some(Arc::new(step));
    }

    pub fn with_default_branch<S: WorkflowStep + 'static>(mut self, step: S) -> Self {
        self.set_default_branch(step);
        self
    }

    pub fn branches(&self) -> &[ConditionalBranch] {
        &self.branches
    }

    pub fn default_branch(&self) -> Option<&Arc<dyn WorkflowStep>> {
        self.default_branch.as_ref()
    }

    /// Branches in evaluation order.
    fn sorted_branches(&self) -> Vec<&ConditionalBranch> {
        let mut sorted: Vec<_> = self.branches.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        sorted
    }

    async fn execute_branches(
        &self,
        ctx: &Context,
        input: &Arc<State>,
    ) -> Result<Arc<State>, WorkflowError> {
        let mut current = WorkflowState::new(input.clone());
        let mut executed: Vec<String> = Vec::new();
        let run_all = self.config.evaluate_all_conditions || self.config.allow_multiple_matches;

        for branch in self.sorted_branches() {
            self.base.wait_while_paused(ctx).await?;
            if let Some(e) = ctx.err() {
                return Err(e);
            }

            if !(branch.condition)(current.state()) {
                debug!(workflow = %self.base.name(), branch = %branch.name, "Condition not met");
                continue;
            }

            info!(
                workflow = %self.base.name(),
                branch = %branch.name,
                priority = branch.priority,
                "Condition matched"
            );
            self.base.emit(
                EventType::WorkflowStep,
                json!({ "branch": branch.name, "priority": branch.priority }),
            );

            let name = StepName::new(branch.name.as_str());
            current = self
                .base
                .run_step(ctx, &branch.step, &name, &current, &RetryPolicy::None)
                .await
                .map_err(|e| WorkflowError::BranchFailed {
                    branch: branch.name.clone(),
                    source: Box::new(e),
                })?;
            executed.push(branch.name.clone());

            if !run_all {
                break;
            }
        }

        if executed.is_empty() {
            if let Some(default) = &self.default_branch {
                info!(workflow = %self.base.name(), "No condition matched, running default branch");
                self.base.emit(
                    EventType::WorkflowStep,
                    json!({ "branch": DEFAULT_BRANCH }),
                );
                let name = StepName::new(DEFAULT_BRANCH);
                current = self
                    .base
                    .run_step(ctx, default, &name, &current, &RetryPolicy::None)
                    .await
                    .map_err(|e| WorkflowError::DefaultBranchFailed {
                        source: Box::new(e),
                    })?;
                executed.push(DEFAULT_BRANCH.to_string());
            } else {
                info!(workflow = %self.base.name(), "No condition matched");
            }
        }

        let mut result = current.into_state();
        // never annotate the caller's input in place
        if Arc::ptr_eq(&result, input) {
            result = Arc::new(input.as_ref().clone());
        }
        result.set_metadata("executed_branches", executed);
        result.set_metadata("total_branches", self.branches.len());
        result.set_metadata("has_default", self.default_branch.is_some());
        Ok(result)
    }
}

#[async_trait]
impl Workflow for ConditionalAgent {
    fn base(&self) -> &BaseWorkflowAgent {
        &self.base
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        self.base.validate_name()?;
        if self.branches.is_empty() && self.default_branch.is_none() {
            return Err(WorkflowError::configuration(
                "conditional workflow must have at least one branch or a default branch",
            ));
        }
        let mut seen = HashSet::new();
        for (index, branch) in self.branches.iter().enumerate() {
            if branch.name.is_empty() {
                return Err(WorkflowError::configuration(format!(
                    "branch {index} has empty name"
                )));
            }
            if branch.name == DEFAULT_BRANCH {
                return Err(WorkflowError::configuration(format!(
                    "branch name {DEFAULT_BRANCH:?} is reserved for the default branch"
                )));
            }
            if !seen.insert(branch.name.as_str()) {
                return Err(WorkflowError::configuration(format!(
                    "duplicate branch name {:?}",
                    branch.name
                )));
            }
            branch.step.validate().map_err(|e| {
                WorkflowError::configuration(format!(
                    "branch {} step validation failed: {e}",
                    branch.name
                ))
            })?;
        }
        if let Some(default) = &self.default_branch {
            default.validate().map_err(|e| {
                WorkflowError::configuration(format!("default branch validation failed: {e}"))
            })?;
        }
        Ok(())
    }

    async fn run(&self, ctx: &Context, input: Arc<State>) -> Result<Arc<State>, WorkflowError> {
        Workflow::validate(self).map_err(WorkflowError::invalid)?;

        let mut names: Vec<StepName> = self
            .branches
            .iter()
            .map(|branch| StepName::new(branch.name.as_str()))
            .collect();
        if self.default_branch.is_some() {
            names.push(StepName::new(DEFAULT_BRANCH));
        }
        let ctx = self
            .base
            .begin_run(
                ctx,
                &input,
                names,
                json!({
                    "branches": self.branches.len(),
                    "has_default": self.default_branch.is_some(),
                }),
            )
            .await;

        let result = self.execute_branches(&ctx, &input).await;
        self.base.finish_run(&ctx, &input, result).await
    }
}
