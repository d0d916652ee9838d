//! Common command-line arguments for hub services

use std::path::PathBuf;

use clap::Parser;

/// Service startup arguments
#[derive(Debug, Clone, Default, Parser)]
#[clap(author, version, about)]
pub struct ServiceArgs {
    /// Configuration file (YAML)
    #[clap(short = 'c', long, env = "HUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short = 'l', long, env = "HUB_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,

    /// Use simulated lighting and serial buses regardless of configuration
    #[clap(long)]
    pub simulate: bool,
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level, INFO when absent or unknown
    pub fn parse_log_level(&self) -> tracing::Level {
        match self
            .log_level
            .as_deref()
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("trace") => tracing::Level::TRACE,
            Some("debug") => tracing::Level::DEBUG,
            Some("warn") | Some("warning") => tracing::Level::WARN,
            Some("error") => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Effective filter level: the command line wins over the configured one
    pub fn effective_log_level(&self, configured: &str) -> String {
        match &self.log_level {
            Some(_) => self.parse_log_level().as_str().to_lowercase(),
            None => configured.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = ServiceArgs::default();
        assert!(args.log_level.is_none());
        assert!(!args.simulate);
        assert!(!args.validate);
    }

    #[test]
    fn test_parse_log_level() {
        let args = ServiceArgs {
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        assert_eq!(args.parse_log_level(), tracing::Level::DEBUG);

        let args = ServiceArgs {
            log_level: Some("WARN".to_string()),
            ..Default::default()
        };
        assert_eq!(args.parse_log_level(), tracing::Level::WARN);

        let args = ServiceArgs {
            log_level: Some("invalid".to_string()),
            ..Default::default()
        };
        assert_eq!(args.parse_log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_parse_from_command_line() {
        let args =
            ServiceArgs::parse_from(["hubsrv", "--config", "hub.yaml", "--simulate", "-l", "trace"]);
        assert_eq!(args.config, Some(PathBuf::from("hub.yaml")));
        assert!(args.simulate);
        assert_eq!(args.parse_log_level(), tracing::Level::TRACE);
    }

    #[test]
    fn test_effective_log_level() {
        let args = ServiceArgs::default();
        assert_eq!(args.effective_log_level("warn"), "warn");

        let args = ServiceArgs {
            log_level: Some("Debug".to_string()),
            ..Default::default()
        };
        assert_eq!(args.effective_log_level("warn"), "debug");
    }
}
