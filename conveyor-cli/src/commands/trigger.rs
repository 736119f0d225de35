//! Trigger command handlers
//!
//! Stand-ins for the webhook and build-notification collaborators, handy
//! when wiring up a new pipeline.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conveyor_client::ConveyorClient;
use conveyor_core::domain::artifact::BuildArtifact;
use conveyor_core::domain::trigger::{BuildEvent, TriggerEvent};
use conveyor_core::dto::run::RunSummary;

/// Trigger subcommands
#[derive(Subcommand)]
pub enum TriggerCommands {
    /// Report a push to a repository branch
    Push {
        #[arg(long)]
        repository: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        commit: String,
    },
    /// Report a finished image build of the application
    Build {
        #[arg(long)]
        repository: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        commit: String,
        /// Image name without tag (e.g. registry.io/org/app)
        #[arg(long)]
        image: String,
        #[arg(long)]
        tag: String,
        #[arg(long)]
        digest: Option<String>,
    },
    /// Redeploy an earlier tag of the configured image
    Rollback {
        tag: String,
    },
}

pub async fn handle_trigger_command(
    command: TriggerCommands,
    client: &ConveyorClient,
) -> Result<()> {
    match command {
        TriggerCommands::Push {
            repository,
            branch,
            commit,
        } => {
            let event = TriggerEvent {
                repository,
                branch,
                commit_sha: commit,
            };
            report(client.notify_push(&event).await?);
        }
        TriggerCommands::Build {
            repository,
            branch,
            commit,
            image,
            tag,
            digest,
        } => {
            let mut artifact = BuildArtifact::new(repository.clone(), image, tag);
            if let Some(digest) = digest {
                artifact = artifact.with_digest(digest);
            }
            let event = BuildEvent {
                trigger: TriggerEvent {
                    repository,
                    branch,
                    commit_sha: commit,
                },
                artifact,
            };
            report(client.notify_build(&event).await?);
        }
        TriggerCommands::Rollback { tag } => {
            report(Some(client.rollback(tag).await?));
        }
    }

    Ok(())
}

fn report(run: Option<RunSummary>) {
    match run {
        Some(run) => {
            println!("{} Started {} run", "✓".green(), run.kind.to_string().bold());
            println!("  ID: {}", run.id.to_string().cyan());
            if let Some(image) = &run.image_ref {
                println!("  Image: {}", image);
            }
        }
        None => println!("{}", "No pipeline watches that branch; nothing started.".yellow()),
    }
}
