//! ID resolver module
//!
//! Lets users type short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use conveyor_client::ConveyorClient;
use uuid::Uuid;

/// Picks the single id starting with `prefix` (case-insensitive)
fn match_prefix(kind: &str, prefix: &str, ids: impl IntoIterator<Item = Uuid>) -> Result<Uuid> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        return Err(anyhow!("{} ID cannot be empty", kind));
    }

    let matches: Vec<Uuid> = ids
        .into_iter()
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No {} found with ID starting with '{}'", kind, prefix)),
        [id] => Ok(*id),
        many => {
            let ids: Vec<String> = many.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple {}s: {}",
                prefix,
                kind,
                ids.join(", ")
            ))
        }
    }
}

/// Resolve a run ID or prefix against the run list
pub async fn resolve_run_id(client: &ConveyorClient, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let runs = client
        .list_runs()
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix("run", input, runs.iter().map(|r| r.id))
}

/// Resolve an approval ID or prefix against the pending requests
pub async fn resolve_approval_id(client: &ConveyorClient, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let pending = client
        .list_pending_approvals()
        .await
        .context("Failed to fetch approvals for ID resolution")?;

    match_prefix("approval", input, pending.iter().map(|a| a.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn test_unique_prefix_resolves() {
        let ids = [
            id("1a2b3c4d-0000-0000-0000-000000000000"),
            id("9f8e7d6c-0000-0000-0000-000000000000"),
        ];
        assert_eq!(match_prefix("run", "1A2B", ids).unwrap(), ids[0]);
    }

    #[test]
    fn test_ambiguous_and_missing_prefixes() {
        let ids = [
            id("1a2b3c4d-0000-0000-0000-000000000000"),
            id("1a2bffff-0000-0000-0000-000000000000"),
        ];

        let err = match_prefix("run", "1a2b", ids).unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));

        let err = match_prefix("run", "ff", ids).unwrap_err();
        assert!(err.to_string().contains("No run found"));

        assert!(match_prefix("run", "  ", ids).is_err());
    }
}
