use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::cache::CalendarCache;
use crate::config::Config;
use crate::sync::SyncOrchestrator;

pub mod agenda;
pub mod auth;
pub mod serve;
pub mod sync_ops;

/// Trait for all command implementations
#[async_trait]
pub trait Command {
    /// Execute the command with the provided context
    async fn execute(&mut self, context: &CommandContext) -> Result<()>;
}

/// Shared context for all commands
pub struct CommandContext {
    pub config: Arc<RwLock<Config>>,
    pub cache: CalendarCache,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl CommandContext {
    pub fn new(
        config: Arc<RwLock<Config>>,
        cache: CalendarCache,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            config,
            cache,
            orchestrator,
        }
    }
}
