use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Command, CommandContext};

/// Command to run one manual sync pass
pub struct SyncCommand {
    pub fresh: bool,
}

/// Command to print sync diagnostics
pub struct StatusCommand;

#[async_trait]
impl Command for SyncCommand {
    async fn execute(&mut self, context: &CommandContext) -> Result<()> {
        if !context.orchestrator.is_authorized().await {
            bail!("Not authorized with Google Calendar. Run 'calsyncd auth-google' first.");
        }

        if self.fresh {
            info!("Running full resync (sync tokens discarded)");
        }
        let report = context.orchestrator.sync_all_calendars(self.fresh).await?;

        println!(
            "Sync complete: {} synced, {} skipped, {} failed",
            report.synced.len(),
            report.skipped.len(),
            report.failed.len()
        );
        for (calendar_id, error) in &report.failed {
            println!("  FAILED {}: {}", calendar_id, error);
        }
        Ok(())
    }
}

#[async_trait]
impl Command for StatusCommand {
    async fn execute(&mut self, context: &CommandContext) -> Result<()> {
        let (status, calendars) = context.orchestrator.detailed_status().await?;

        println!("Authorized:      {}", status.authorized);
        println!("Background sync: {}", status.background_sync_running);
        println!("Interval:        {} minutes", status.interval_minutes);
        match status.last_full_sync {
            Some(at) => println!("Last full sync:  {}", at.to_rfc3339()),
            None => println!("Last full sync:  never"),
        }
        if let Some(error) = status.last_error {
            println!("Last error:      {}", error);
        }

        println!("\nCalendars ({}):", calendars.len());
        for calendar in calendars {
            println!(
                "  {} ({}) - {} events, last sync {}{}",
                calendar.calendar_name,
                calendar.calendar_id,
                calendar.event_count,
                calendar.last_sync.to_rfc3339(),
                if calendar.sync_in_progress {
                    " [sync in progress]"
                } else {
                    ""
                }
            );
        }
        Ok(())
    }
}
