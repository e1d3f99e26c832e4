// prune-prompt-archives: retention-based deletion of archived prompt
// renders, chunked scan, dry-run support.

use chrono::{Duration, Utc};
use clap::Args;
use perpetua_core::traits::PromptArchiveStore;

use crate::{EXIT_OK, EXIT_PARTIAL_FAILURE};

#[derive(Args)]
pub struct PruneArgs {
    /// Retention window in days; defaults to PROMPT_ARCHIVE_RETENTION_DAYS
    #[arg(long)]
    pub days: Option<i64>,

    /// Only report the number of archives that would be deleted
    #[arg(long)]
    pub dry_run: bool,

    /// Number of rows to delete per batch when pruning
    #[arg(long, default_value_t = 500)]
    pub chunk_size: usize,
}

pub async fn run(args: PruneArgs) -> anyhow::Result<i32> {
    let retention_days = args.days.unwrap_or_else(|| {
        std::env::var("PROMPT_ARCHIVE_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30)
    });

    if retention_days < 0 {
        println!("Retention is negative ({retention_days}); skipping prune.");
        return Ok(EXIT_OK);
    }

    let stores = match super::connect().await? {
        Ok(stores) => stores,
        Err(code) => return Ok(code),
    };

    let cutoff = Utc::now() - Duration::days(retention_days);
    match stores
        .prune_older_than(cutoff, args.chunk_size, args.dry_run)
        .await
    {
        Ok(outcome) if args.dry_run => {
            println!(
                "[DRY RUN] Prompt archive prune completed. {} archives older than {} day(s) identified.",
                outcome.found, retention_days
            );
            Ok(EXIT_OK)
        }
        Ok(outcome) => {
            println!(
                "Prompt archive prune completed. {} archives inspected, {} deleted.",
                outcome.found, outcome.deleted
            );
            Ok(EXIT_OK)
        }
        Err(err) => {
            eprintln!("prune failed: {err}");
            Ok(EXIT_PARTIAL_FAILURE)
        }
    }
}
