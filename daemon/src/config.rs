use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub sync: SyncConfig,
    pub google_calendar: Option<GoogleCalendarConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL for the persistent event cache
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Background sync cadence in minutes (minimum 1)
    pub interval_minutes: u32,
    /// How far back a full re-fetch reaches
    pub window_past_days: u32,
    /// How far ahead a full re-fetch reaches
    pub planning_horizon_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleCalendarConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Calendars to sync; empty means every calendar on the account
    pub calendar_ids: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 3890,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            sync: SyncConfig {
                interval_minutes: 15,
                window_past_days: 30,
                planning_horizon_days: 90,
            },
            google_calendar: Some(GoogleCalendarConfig {
                enabled: false, // Disabled by default, user must configure
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: "http://localhost:8080/auth/callback".to_string(),
                calendar_ids: vec!["primary".to_string()],
            }),
        }
    }
}

impl Config {
    pub async fn load() -> Result<Arc<RwLock<Config>>> {
        let config_path = Self::get_config_path()?;

        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        } else {
            info!("Config file not found, creating default configuration");
            let default_config = Config::default();
            default_config.save().await?;
            default_config
        };

        Ok(Arc::new(RwLock::new(config)))
    }

    pub async fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("calsyncd");
        Ok(config_dir.join("config.toml"))
    }

    /// Data directory for stored OAuth tokens
    pub fn get_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("calsyncd");
        Ok(data_dir)
    }
}
