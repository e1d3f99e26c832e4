// run-evals: dispatch eval runs and poll until every task is terminal.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use perpetua_core::clock::SystemClock;
use perpetua_core::evals::{AgentStrategy, EvalDispatcher, EvalRunType};
use uuid::Uuid;

use crate::{EXIT_INVALID_ARGUMENT, EXIT_OK, EXIT_PARTIAL_FAILURE};

#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    EphemeralPerScenario,
    ReuseAgent,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RunTypeArg {
    OneOff,
    Official,
}

#[derive(Args)]
pub struct RunEvalsArgs {
    /// Suite slug; repeat for multiple suites
    #[arg(long = "suite", required = true)]
    pub suites: Vec<String>,

    /// Restrict to one scenario slug
    #[arg(long)]
    pub scenario: Option<String>,

    /// Designated agent for the reuse_agent strategy
    #[arg(long)]
    pub agent_id: Option<Uuid>,

    #[arg(long, value_enum, default_value = "ephemeral-per-scenario")]
    pub agent_strategy: StrategyArg,

    /// Wait for completion and report the summary
    #[arg(long)]
    pub sync: bool,

    #[arg(long, value_enum, default_value = "one-off")]
    pub run_type: RunTypeArg,

    /// Shorthand for --run-type official
    #[arg(long)]
    pub official: bool,

    /// Poll interval in seconds when --sync is set
    #[arg(long, default_value_t = 5)]
    pub poll_seconds: u64,

    /// Give up after this many seconds when --sync is set
    #[arg(long, default_value_t = 3600)]
    pub timeout_seconds: u64,
}

pub async fn run(args: RunEvalsArgs) -> anyhow::Result<i32> {
    let strategy = match args.agent_strategy {
        StrategyArg::EphemeralPerScenario => AgentStrategy::EphemeralPerScenario,
        StrategyArg::ReuseAgent => AgentStrategy::ReuseAgent,
    };
    if strategy == AgentStrategy::ReuseAgent && args.agent_id.is_none() {
        eprintln!("--agent-strategy reuse-agent requires --agent-id");
        return Ok(EXIT_INVALID_ARGUMENT);
    }
    let run_type = if args.official {
        EvalRunType::Official
    } else {
        match args.run_type {
            RunTypeArg::OneOff => EvalRunType::OneOff,
            RunTypeArg::Official => EvalRunType::Official,
        }
    };

    let stores = match super::connect().await? {
        Ok(stores) => stores,
        Err(code) => return Ok(code),
    };
    let dispatcher = EvalDispatcher::new(Arc::new(stores), Arc::new(SystemClock));

    let runs = match dispatcher
        .dispatch(&args.suites, args.scenario.as_deref(), run_type, strategy, args.agent_id)
        .await
    {
        Ok(runs) => runs,
        Err(err) => {
            eprintln!("dispatch failed: {err}");
            return Ok(EXIT_INVALID_ARGUMENT);
        }
    };
    for run in &runs {
        println!("dispatched run {} for suite {}", run.id, run.suite_slug);
    }

    if !args.sync {
        return Ok(EXIT_OK);
    }

    let summary = dispatcher
        .poll_until_terminal(
            &runs,
            Duration::from_secs(args.poll_seconds),
            Duration::from_secs(args.timeout_seconds),
        )
        .await?;

    println!(
        "eval summary: {} total, {} passed, {} failed, {} errored",
        summary.total, summary.passed, summary.failed, summary.errored
    );
    if summary.all_passed() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_PARTIAL_FAILURE)
    }
}
