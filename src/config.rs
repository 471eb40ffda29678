use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::leaderboard::LeaderboardLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub leaderboard: LeaderboardConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing, default)]
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Upper bound for a single CLI operation against the store.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardConfig {
    pub top_students: usize,
    pub top_groups: usize,
}

impl AppConfig {
    /// Loads `scoreboard.toml` (optional), then `SCOREBOARD_*` variables
    /// such as `SCOREBOARD_STORE__TIMEOUT_SECS`, then `DATABASE_URL` and
    /// `RUST_LOG`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(Some("scoreboard"))?.build()?.try_deserialize()
    }

    fn builder(
        file: Option<&str>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let limits = LeaderboardLimits::default();
        let mut builder = Config::builder()
            .set_default("app.log_level", "info")?
            .set_default("app.log_format", "pretty")?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 5_i64)?
            .set_default("store.timeout_secs", 15_i64)?
            .set_default("leaderboard.top_students", limits.top_students as i64)?
            .set_default("leaderboard.top_groups", limits.top_groups as i64)?;

        if let Some(name) = file {
            builder = builder
                .add_source(File::with_name(name).required(false))
                .add_source(
                    Environment::with_prefix("SCOREBOARD")
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                )
                .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
                .set_override_option("app.log_level", std::env::var("RUST_LOG").ok())?;
        }

        Ok(builder)
    }

    pub fn leaderboard_limits(&self) -> LeaderboardLimits {
        LeaderboardLimits {
            top_students: self.leaderboard.top_students,
            top_groups: self.leaderboard.top_groups,
        }
    }
}
