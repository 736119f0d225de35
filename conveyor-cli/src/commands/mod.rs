//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod approval;
mod run;
mod trigger;

pub use approval::ApprovalCommands;
pub use run::RunCommands;
pub use trigger::TriggerCommands;

use anyhow::Result;
use clap::Subcommand;
use conveyor_client::ConveyorClient;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and cancel pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Deliver pushes, builds and rollbacks by hand
    Trigger {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Review and decide approval requests
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Check that the orchestrator is reachable
    Health,
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, client: &ConveyorClient) -> Result<()> {
    match command {
        Commands::Run { command } => run::handle_run_command(command, client).await,
        Commands::Trigger { command } => trigger::handle_trigger_command(command, client).await,
        Commands::Approval { command } => {
            approval::handle_approval_command(command, client).await
        }
        Commands::Health => {
            client.health().await?;
            println!("Orchestrator at {} is healthy", client.base_url());
            Ok(())
        }
    }
}
