// Configuration management with layered configuration (file, env)

use crate::schedule::MissedFirePolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub database: DatabaseConfig,
    pub export: ExportConfig,
    pub mail: MailConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON task catalog
    pub path: PathBuf,
    pub lock_timeout_ms: u64,
    /// Lock files older than this are considered abandoned
    pub lock_stale_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tasks.json"),
            lock_timeout_ms: 5_000,
            lock_stale_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub reconcile_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub missed_fire_policy: MissedFirePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 10,
            shutdown_grace_seconds: 30,
            lease_ttl_seconds: 45,
            missed_fire_policy: MissedFirePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound for one execution; unbounded when absent
    pub execution_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub outbox_dir: PathBuf,
    pub from_address: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            outbox_dir: PathBuf::from("outbox"),
            from_address: "reports@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.store.path.as_os_str().is_empty() {
            return Err("Store path cannot be empty".to_string());
        }
        if self.store.lock_timeout_ms == 0 {
            return Err("Store lock_timeout_ms must be greater than 0".to_string());
        }
        if self.store.lock_stale_seconds == 0 {
            return Err("Store lock_stale_seconds must be greater than 0".to_string());
        }

        if self.scheduler.reconcile_interval_seconds == 0 {
            return Err("Scheduler reconcile_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.lease_ttl_seconds <= self.scheduler.reconcile_interval_seconds {
            return Err(
                "Scheduler lease_ttl_seconds must exceed reconcile_interval_seconds".to_string(),
            );
        }

        if self.runner.execution_timeout_seconds == Some(0) {
            return Err("Runner execution_timeout_seconds must be greater than 0".to_string());
        }

        if self.database.connect_timeout_seconds == 0 {
            return Err("Database connect_timeout_seconds must be greater than 0".to_string());
        }

        if self.export.output_dir.as_os_str().is_empty() {
            return Err("Export output_dir cannot be empty".to_string());
        }

        if self.mail.outbox_dir.as_os_str().is_empty() {
            return Err("Mail outbox_dir cannot be empty".to_string());
        }
        if !self.mail.from_address.contains('@') {
            return Err("Mail from_address must be an email address".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_short_lease() {
        let mut settings = Settings::default();
        settings.scheduler.lease_ttl_seconds = settings.scheduler.reconcile_interval_seconds;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_timeout() {
        let mut settings = Settings::default();
        settings.runner.execution_timeout_seconds = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_from_address() {
        let mut settings = Settings::default();
        settings.mail.from_address = "nobody".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_empty_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.store.path, PathBuf::from("tasks.json"));
        assert_eq!(settings.scheduler.missed_fire_policy, MissedFirePolicy::Skip);
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            "[scheduler]\nmissed_fire_policy = \"fire_once\"\n\n[store]\npath = \"/var/lib/reports/tasks.json\""
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(
            settings.scheduler.missed_fire_policy,
            MissedFirePolicy::FireOnce
        );
        assert_eq!(
            settings.store.path,
            PathBuf::from("/var/lib/reports/tasks.json")
        );
        assert_eq!(settings.scheduler.shutdown_grace_seconds, 30);
    }
}
