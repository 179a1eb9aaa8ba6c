use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io::{self, Write};

use super::{Command, CommandContext};

/// Command to set up Google Calendar OAuth
pub struct AuthGoogleCommand;

#[async_trait]
impl Command for AuthGoogleCommand {
    async fn execute(&mut self, context: &CommandContext) -> Result<()> {
        let Some(google) = context.orchestrator.google() else {
            bail!(
                "Google Calendar is not configured. Set client_id and client_secret in {:?} and enable it.",
                crate::config::Config::get_config_path()?
            );
        };

        let auth_url = google.auth_url()?;

        println!("Open this URL in your browser and authorize calendar access:\n");
        println!("  {}\n", auth_url);
        print!("Paste the authorization code here: ");
        io::stdout().flush().context("Failed to flush stdout")?;

        let mut code = String::new();
        io::stdin()
            .read_line(&mut code)
            .context("Failed to read authorization code")?;
        let code = code.trim();
        if code.is_empty() {
            bail!("No authorization code provided");
        }

        google.authenticate_with_code(code).await?;

        let calendars = google.list_calendars().await?;
        println!("\nAuthentication successful. Available calendars:");
        for calendar in calendars {
            println!("  {} ({})", calendar.summary, calendar.id);
        }
        println!("\nAdd the calendar IDs you want synced to the config file, or leave the list empty to sync all of them.");
        Ok(())
    }
}
