//! Run command handlers
//!
//! Listing, inspecting, watching and cancelling pipeline runs.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conveyor_client::ConveyorClient;
use conveyor_core::domain::run::{PipelineRun, RunStatus, StageEvent, StageOutcome};
use conveyor_core::dto::run::RunSummary;
use std::time::Duration;

use crate::id_resolver::resolve_run_id;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List runs, most recent first
    List {
        /// Only show runs that have not finished
        #[arg(long)]
        active: bool,
    },
    /// Show run details
    Get {
        /// Run ID or unambiguous prefix
        id: String,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },
    /// Show the stage events of a run
    Events {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Poll a run until it finishes
    Watch {
        /// Run ID or unambiguous prefix
        id: String,

        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Cancel an active run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_run_command(command: RunCommands, client: &ConveyorClient) -> Result<()> {
    match command {
        RunCommands::List { active } => list_runs(client, active).await,
        RunCommands::Get { id, json } => get_run(client, &id, json).await,
        RunCommands::Events { id } => list_events(client, &id).await,
        RunCommands::Watch { id, interval } => watch_run(client, &id, interval).await,
        RunCommands::Cancel { id } => cancel_run(client, &id).await,
    }
}

async fn list_runs(client: &ConveyorClient, active_only: bool) -> Result<()> {
    let runs: Vec<RunSummary> = client
        .list_runs()
        .await?
        .into_iter()
        .filter(|r| !active_only || !r.status.is_terminal())
        .collect();

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", runs.len()).bold());
    println!();
    for run in &runs {
        print_run_summary(run);
    }

    Ok(())
}

async fn get_run(client: &ConveyorClient, id: &str, json: bool) -> Result<()> {
    let uuid = resolve_run_id(client, id).await?;
    let run = client.get_run(uuid).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_details(&run);
    }

    Ok(())
}

async fn list_events(client: &ConveyorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, id).await?;
    let events = client.get_run_events(uuid).await?;

    if events.is_empty() {
        println!("{}", "No stages have completed yet.".yellow());
    } else {
        println!("{}", format!("Stages of run {}:", uuid).bold());
        for event in &events {
            print_stage_event(event);
        }
    }

    Ok(())
}

async fn watch_run(client: &ConveyorClient, id: &str, interval: u64) -> Result<()> {
    let uuid = resolve_run_id(client, id).await?;
    let mut last_status = None;
    let mut seen_events = 0;

    loop {
        let run = client.get_run(uuid).await?;

        for event in run.events.iter().skip(seen_events) {
            print_stage_event(event);
        }
        seen_events = run.events.len();

        if last_status != Some(run.status) {
            println!("  {} {}", "status".dimmed(), colorize_status(run.status));
            last_status = Some(run.status);
        }

        if run.is_terminal() {
            if let Some(failure) = &run.failure {
                println!("  {} {}", "reason".dimmed(), failure.to_string().red());
            }
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}

async fn cancel_run(client: &ConveyorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, id).await?;
    client.cancel_run(uuid).await?;

    println!("{} Cancellation requested for run {}", "✓".green(), uuid);
    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!(
        "  {} {} {} {}",
        "▸".cyan(),
        run.kind.to_string().bold(),
        run.id.to_string().dimmed(),
        colorize_status(run.status)
    );
    if let Some(image) = &run.image_ref {
        println!("    Image:   {}", image);
    }
    if let Some(stage) = run.current_stage {
        println!("    Stage:   {}", stage);
    }
    println!(
        "    Started: {}",
        run.started_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(failure) = &run.failure {
        println!("    Reason:  {}", failure.to_string().red());
    }
    println!();
}

fn print_run_details(run: &PipelineRun) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Kind:      {}", run.kind);
    println!("  Status:    {}", colorize_status(run.status));
    println!("  Started:   {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(ended) = run.ended_at {
        println!("  Ended:     {}", ended.format("%Y-%m-%d %H:%M:%S"));
        let seconds = ended.signed_duration_since(run.started_at).num_seconds();
        println!("  Duration:  {}s", seconds);
    }
    if let Some(artifact) = &run.artifact {
        println!("  Image:     {}", artifact.image_ref());
    }
    if let Some(sha) = &run.commit_sha {
        println!("  Commit:    {}", sha);
    }
    if let Some(approval) = run.approval_id {
        println!("  Approval:  {}", approval);
    }
    if let Some(stage) = run.last_successful_stage {
        println!("  Last good: {}", stage);
    }
    if let Some(failure) = &run.failure {
        println!("  Reason:    {}", failure.to_string().red());
    }

    if !run.events.is_empty() {
        println!("\n{}", "Stages:".bold());
        for event in &run.events {
            print_stage_event(event);
        }
    }
}

fn print_stage_event(event: &StageEvent) {
    let marker = match event.outcome {
        StageOutcome::Succeeded => "✓".green(),
        StageOutcome::Failed => "✗".red(),
        StageOutcome::Cancelled => "■".yellow(),
    };
    let millis = event
        .ended_at
        .signed_duration_since(event.started_at)
        .num_milliseconds();

    print!("  {} {:<22} {}", marker, event.stage.to_string(), format!("{}ms", millis).dimmed());
    match &event.detail {
        Some(detail) => println!("  {}", detail),
        None => println!(),
    }
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Pending => text.yellow(),
        RunStatus::Running => text.blue(),
        RunStatus::AwaitingApproval => text.magenta(),
        RunStatus::Succeeded => text.green(),
        RunStatus::Failed => text.red(),
        RunStatus::Cancelled => text.dimmed(),
    }
}
