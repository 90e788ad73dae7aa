//! Application configuration.
//!
//! Loaded from YAML files and environment variables:
//!
//! ```yaml
//! messaging:
//!   type: channel            # channel | nats | nsq
//!   address: "localhost:4150"
//!   lookup: ["localhost:4161"]
//!   reply_timeout_ms: 30000
//!   breaker:
//!     timeout_ms: 60000
//!     threshold: 5
//!   settings:
//!     max_attempts: 5
//!     default_requeue_delay_ms: 90000
//! ```
//!
//! Every key can be overridden from the environment, e.g.
//! `MSGBUS__MESSAGING__ADDRESS=broker:4150`.

use serde::Deserialize;

use crate::bus::MessagingConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MSGBUS_CONFIG";
/// Prefix for environment variable overrides.
pub const CONFIG_ENV_PREFIX: &str = "MSGBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MSGBUS_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker, emitter and listener settings.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config.yaml` in the working directory, if present
    /// 2. the file at `path`, if given (must exist)
    /// 3. the file named by `MSGBUS_CONFIG`, if set (must exist)
    /// 4. `MSGBUS__`-prefixed environment variables, `__` separating keys
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("messaging.lookup"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TransportType;
    use serial_test::serial;
    use std::io::Write;

    /// Remove every variable `Config::load` reads from the environment.
    fn clear_environment() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let overrides: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&format!("{}__", CONFIG_ENV_PREFIX)))
            .collect();
        for key in overrides {
            std::env::remove_var(key);
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_without_sources_uses_defaults() {
        std::env::set_var("MSGBUS__MESSAGING__ADDRESS", "leftover:4150");
        clear_environment();

        let config = Config::load(None).unwrap();
        assert_eq!(config.messaging.address, crate::bus::DEFAULT_ADDRESS);
        assert_eq!(config.messaging.transport_type, TransportType::Channel);
    }

    #[test]
    #[serial]
    fn test_load_from_explicit_file() {
        clear_environment();
        let file = write_config(
            r#"
messaging:
  type: nats
  address: "broker:4222"
  lookup: ["a:4222", "b:4222"]
  reply_timeout_ms: 1500
  breaker:
    threshold: 3
  settings:
    max_attempts: 9
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        let messaging = config.messaging;
        assert_eq!(messaging.transport_type, TransportType::Nats);
        assert_eq!(messaging.address, "broker:4222");
        assert_eq!(messaging.lookup, vec!["a:4222", "b:4222"]);
        assert_eq!(messaging.reply_timeout_ms, 1500);
        assert_eq!(messaging.breaker.threshold, 3);
        assert_eq!(messaging.settings.max_attempts, Some(9));
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_environment();
        assert!(Config::load(Some("/nonexistent/msgbus.yaml")).is_err());
    }

    #[test]
    #[serial]
    fn test_config_env_var_names_file() {
        clear_environment();
        let file = write_config("messaging:\n  address: \"from-env-file:4150\"\n");
        std::env::set_var(CONFIG_ENV_VAR, file.path());

        let config = Config::load(None);
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.unwrap().messaging.address, "from-env-file:4150");
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        clear_environment();
        let file = write_config("messaging:\n  address: \"file:4150\"\n");
        std::env::set_var("MSGBUS__MESSAGING__ADDRESS", "env:4150");

        let config = Config::load(file.path().to_str());
        std::env::remove_var("MSGBUS__MESSAGING__ADDRESS");

        assert_eq!(config.unwrap().messaging.address, "env:4150");
    }
}
