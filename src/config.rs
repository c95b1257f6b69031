// ⚙️ Application configuration
//
// Lookup order: explicit path, then $MARGIN_LEDGER_CONFIG, then defaults.
// MARGIN_LEDGER_DB and MARGIN_LEDGER_OVERHEAD_PROJECT override the file.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregate::{AggregateOptions, DEFAULT_TOP_N, DEFAULT_TRAILING_MONTHS};
use crate::entities::ProjectId;

pub const CONFIG_ENV: &str = "MARGIN_LEDGER_CONFIG";
pub const DB_ENV: &str = "MARGIN_LEDGER_DB";
pub const OVERHEAD_ENV: &str = "MARGIN_LEDGER_OVERHEAD_PROJECT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Dashboard polling interval
    pub refresh_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:3000".to_string(),
            refresh_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,

    /// Project id of the shared "General" overhead project
    pub overhead_project_id: Option<String>,

    pub trailing_months: usize,
    pub top_n: usize,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: PathBuf::from("margin-ledger.db"),
            overhead_project_id: None,
            trailing_months: DEFAULT_TRAILING_MONTHS,
            top_n: DEFAULT_TOP_N,
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Resolve the configuration for this process, env overrides applied
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::from_file(PathBuf::from(path))?,
                None => AppConfig::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(db) = std::env::var_os(DB_ENV) {
            self.database_path = PathBuf::from(db);
        }
        if let Ok(project) = std::env::var(OVERHEAD_ENV) {
            if !project.trim().is_empty() {
                self.overhead_project_id = Some(project.trim().to_string());
            }
        }
    }

    pub fn overhead_project(&self) -> Option<ProjectId> {
        self.overhead_project_id.as_deref().map(ProjectId::new)
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            trailing_months: self.trailing_months,
            top_n: self.top_n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.trailing_months, 6);
        assert_eq!(config.top_n, 5);
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert!(config.overhead_project().is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"overhead_project_id": "GEN", "trailing_months": 12, "server": {"refresh_interval_secs": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.overhead_project(), Some(ProjectId::new("GEN")));
        assert_eq!(config.aggregate_options().trailing_months, 12);
        assert_eq!(config.aggregate_options().top_n, 5);
        assert_eq!(config.server.refresh_interval_secs, 5);
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("margin-ledger-config-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, r#"{"database_path": "/tmp/ledger.db", "top_n": 3}"#).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.top_n, 3);

        fs::remove_file(&path).unwrap();
        assert!(AppConfig::from_file(&path).is_err());
    }
}
