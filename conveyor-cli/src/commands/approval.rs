//! Approval command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conveyor_client::ConveyorClient;
use conveyor_core::domain::approval::{ApprovalRequest, ApprovalState};
use conveyor_core::dto::approval::Decision;

use crate::id_resolver::resolve_approval_id;

/// Approval subcommands
#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List requests still waiting for a decision
    List,
    /// Show an approval request
    Get {
        /// Approval ID or unambiguous prefix
        id: String,
    },
    /// Approve a pending request
    Approve {
        /// Approval ID or unambiguous prefix
        id: String,
        /// Approver identity
        #[arg(long, env = "CONVEYOR_APPROVER")]
        approver: String,
    },
    /// Reject a pending request, failing its run
    Reject {
        /// Approval ID or unambiguous prefix
        id: String,
        /// Approver identity
        #[arg(long, env = "CONVEYOR_APPROVER")]
        approver: String,
    },
}

pub async fn handle_approval_command(
    command: ApprovalCommands,
    client: &ConveyorClient,
) -> Result<()> {
    match command {
        ApprovalCommands::List => {
            let pending = client.list_pending_approvals().await?;
            if pending.is_empty() {
                println!("{}", "No pending approvals.".yellow());
            } else {
                println!("{}", format!("{} pending approval(s):", pending.len()).bold());
                println!();
                for request in &pending {
                    print_request(request);
                }
            }
        }
        ApprovalCommands::Get { id } => {
            let uuid = resolve_approval_id(client, &id).await?;
            print_request(&client.get_approval(uuid).await?);
        }
        ApprovalCommands::Approve { id, approver } => {
            let uuid = resolve_approval_id(client, &id).await?;
            let request = client.decide(uuid, approver, Decision::Approve).await?;
            print_request(&request);
        }
        ApprovalCommands::Reject { id, approver } => {
            let uuid = resolve_approval_id(client, &id).await?;
            let request = client.decide(uuid, approver, Decision::Reject).await?;
            print_request(&request);
        }
    }

    Ok(())
}

fn print_request(request: &ApprovalRequest) {
    let state = match request.state {
        ApprovalState::Pending => request.state.to_string().yellow(),
        ApprovalState::Approved => request.state.to_string().green(),
        ApprovalState::Rejected => request.state.to_string().red(),
        ApprovalState::Expired | ApprovalState::Withdrawn => request.state.to_string().dimmed(),
    };

    println!("  {} Approval {} {}", "▸".cyan(), request.id.to_string().dimmed(), state);
    println!("    Run:       {}", request.run_id);
    println!(
        "    Approvals: {}/{}",
        request.approvals.len(),
        request.required
    );
    if !request.approvals.is_empty() {
        let names: Vec<&str> = request.approvals.iter().map(String::as_str).collect();
        println!("    By:        {}", names.join(", "));
    }
    if let Some(rejected_by) = &request.rejected_by {
        println!("    Rejected:  {}", rejected_by.red());
    }
    println!(
        "    Deadline:  {}",
        request.deadline.format("%Y-%m-%d %H:%M:%S")
    );
    println!();
}
