//! Configuration loading helper functions
//!
//! Layering (lowest to highest): serde defaults, YAML file, prefixed
//! environment variables. Nested keys use `__` in the environment, e.g.
//! `HUB_MODBUS__BAUD_RATE=19200`.

use std::path::Path;

use errors::{HubError, HubResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the layered figment without extracting it
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> HubResult<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(HubError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        figment = match extension {
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(HubError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };
        info!("Config file: {}", path.display());
    } else {
        debug!("No config file, using defaults");
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load configuration with priority: ENV > file > defaults
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> HubResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let figment = figment_for::<T>(path, env_prefix)?;
    Ok(figment.extract()?)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        inner: Inner,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Inner {
        baud_rate: u32,
        enabled: bool,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "hub".to_string(),
                inner: Inner::default(),
            }
        }
    }

    impl Default for Inner {
        fn default() -> Self {
            Self {
                baud_rate: 9600,
                enabled: true,
            }
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let cfg: Sample = load_config(None, "CFGTEST_NOFILE_").unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "inner:\n  baud_rate: 19200").unwrap();

        let cfg: Sample = load_config(Some(file.path()), "CFGTEST_FILE_").unwrap();
        assert_eq!(cfg.inner.baud_rate, 19200);
        assert!(cfg.inner.enabled);
        assert_eq!(cfg.name, "hub");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "inner:\n  baud_rate: 19200").unwrap();

        std::env::set_var("CFGTEST_ENV_INNER__BAUD_RATE", "38400");
        let cfg: Sample = load_config(Some(file.path()), "CFGTEST_ENV_").unwrap();
        std::env::remove_var("CFGTEST_ENV_INNER__BAUD_RATE");

        assert_eq!(cfg.inner.baud_rate, 38400);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = load_config::<Sample>(Some(Path::new("/nonexistent/hub.yaml")), "X_")
            .unwrap_err();
        assert!(matches!(err, HubError::Configuration(_)));
    }
}
