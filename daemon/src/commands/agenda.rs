use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

use super::{Command, CommandContext};
use crate::store::{CalendarEventStore, HttpSnapshotSource};

/// Command to print upcoming events from a running calsyncd server.
///
/// Consumes the API the way a UI would: through the in-memory event store
/// polling the snapshot endpoints.
pub struct AgendaCommand {
    pub days: i64,
}

#[async_trait]
impl Command for AgendaCommand {
    async fn execute(&mut self, context: &CommandContext) -> Result<()> {
        let base_url = {
            let config = context.config.read();
            format!("http://{}:{}", config.server.bind_address, config.server.port)
        };

        let source = Arc::new(HttpSnapshotSource::new(base_url));
        let store = CalendarEventStore::new(source);
        store.initialize().await?;

        if let Some(error) = store.init_error() {
            println!("Warning: snapshot fetch failed ({}), showing nothing", error);
        }

        let now = Utc::now();
        let events = store.get_events(now, now + Duration::days(self.days));

        if events.is_empty() {
            println!("No events in the next {} days", self.days);
        } else {
            println!("Next {} days:", self.days);
            for event in &events {
                println!(
                    "  {}  {}{}",
                    event.start.format("%Y-%m-%d %H:%M"),
                    event.title.as_deref().unwrap_or("(untitled)"),
                    event
                        .location
                        .as_deref()
                        .map(|l| format!(" @ {}", l))
                        .unwrap_or_default()
                );
            }
        }

        store.cleanup();
        Ok(())
    }
}
