//! Research pipeline example.
//!
//! This example demonstrates:
//! 1. A sequential pipeline (generate -> answer -> summarize)
//! 2. A parallel fan-out over several reviewers
//! 3. A conditional router picking a summary style
//! 4. A refinement loop with an until-condition
//! 5. Streaming events with `run_async`

use async_trait::async_trait;
use hataori::prelude::*;
use hataori::{LoggingHook, Message, MetricsHook};
use std::sync::Arc;
use std::time::Duration;

/// Stand-in for a model call: writes a canned response derived from the topic.
#[derive(Debug)]
struct StubAgent {
    name: &'static str,
    template: &'static str,
    latency: Duration,
}

#[async_trait]
impl WorkflowStep for StubAgent {
    fn name(&self) -> StepName {
        StepName::new(self.name)
    }

    async fn execute(
        &self,
        ctx: &Context,
        input: &WorkflowState,
    ) -> Result<WorkflowState, WorkflowError> {
        ctx.sleep(self.latency).await?;

        let topic = input
            .state()
            .get_as::<String>("topic")
            .unwrap_or_else(|| "nothing".to_string());
        let state = input.state().as_ref().clone();
        state.set("response", self.template.replace("{topic}", &topic));
        state.add_message(Message::assistant(format!("{} finished", self.name)));
        Ok(input.with_state(Arc::new(state)))
    }
}

fn agent(name: &'static str, template: &'static str, latency_ms: u64) -> StubAgent {
    StubAgent {
        name,
        template,
        latency: Duration::from_millis(latency_ms),
    }
}

fn refine() -> FnStep {
    FnStep::from_fn("refine", |input: &WorkflowState| {
        let state = input.state().as_ref().clone();
        let quality = state.get_as::<u32>("quality").unwrap_or_default();
        state.set("quality", quality + 30);
        Ok(input.with_state(Arc::new(state)))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let reviewers = ParallelAgent::new("reviewers")
        .with_max_concurrency(2)
        .with_timeout(Duration::from_secs(5))
        .with_step(agent("critic", "weak points of {topic}", 40))?
        .with_step(agent("fan", "strong points of {topic}", 20))?
        .with_step(agent("historian", "history of {topic}", 30))?;

    let summary_style = ConditionalAgent::new("summary-style")
        .with_branch(
            "short",
            |state: &State| state.get_as::<String>("audience").as_deref() == Some("executive"),
            agent("brief", "one-line summary of {topic}", 5),
            10,
        )
        .with_default_branch(agent("detailed", "detailed summary of {topic}", 10));

    let polish = LoopAgent::until_loop(
        "polish",
        |state: &State, _| state.get_as::<u32>("quality").unwrap_or_default() >= 90,
        refine(),
    )
    .with_max_iterations(10);

    let metrics = Arc::new(MetricsHook::new());
    let pipeline = Arc::new(
        SequentialAgent::new("research")
            .with_hook(Arc::new(LoggingHook::new()))
            .with_hook(metrics.clone())
            .with_max_retries(1)
            .with_step(agent("generate", "questions about {topic}", 10))?
            .with_step(agent("answer", "answers about {topic}", 10))?
            .with_step(reviewers)?
            .with_step(summary_style)?
            .with_step(polish)?,
    );

    let input = State::with_values([("topic", "quantum computing"), ("audience", "executive")]);
    let mut events = run_async(pipeline.clone(), Context::new(), input.shared())?;

    while let Some(event) = events.recv().await {
        match event.event_type {
            EventType::WorkflowStep => println!("  -> {}", event.data),
            EventType::AgentComplete if event.data.get("result").is_some() => {
                let values = &event.data["result"]["values"];
                println!("Response: {}", values["response"]);
                println!("Quality:  {}", values["quality"]);
                println!("Reviews:  {}", values["parallel_results"]);
            }
            EventType::AgentError => {
                eprintln!("Error: {}", event.error.unwrap_or_default());
            }
            _ => {}
        }
    }

    let status = pipeline.status();
    println!("Final state: {}", status.state);
    for (name, step) in &status.steps {
        println!("  {name}: {:?} (retries: {})", step.state, step.retries);
    }
    println!("Metrics: {:?}", metrics.metrics());

    Ok(())
}
