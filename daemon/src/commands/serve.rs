use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::info;

use super::{Command, CommandContext};
use crate::server::{self, AppState};

/// Command to run the HTTP API with background sync
pub struct ServeCommand {
    pub port: Option<u16>,
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&mut self, context: &CommandContext) -> Result<()> {
        let addr: SocketAddr = {
            let config = context.config.read();
            let port = self.port.unwrap_or(config.server.port);
            format!("{}:{}", config.server.bind_address, port).parse()?
        };

        if context.orchestrator.is_authorized().await {
            context.orchestrator.start_background_sync();
        } else {
            info!("Google Calendar not authorized; serving cached data only. Run 'calsyncd auth-google' to connect.");
        }

        let state = AppState {
            orchestrator: context.orchestrator.clone(),
            cache: context.cache.clone(),
        };

        server::serve(state, addr).await?;

        context.orchestrator.stop_background_sync();
        info!("calsyncd shut down cleanly");
        Ok(())
    }
}
