use anyhow::{bail, Result};
use config::{Config, Environment, File};
use docverify_core::{ErrorPolicy, RunOptions, TeardownMode, DEFAULT_EPSILON};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Effective configuration: defaults, then `docverify.{toml,yaml,json}` in the
/// working directory, then `--config`, then `DOCVERIFY_*` variables, then flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub dsn: Option<String>,
    pub on_error: ErrorPolicy,
    /// Seconds.
    pub timeout: u64,
    pub teardown: TeardownMode,
    pub epsilon: f64,
    pub format: OutputFormat,
    pub log_format: LogFormat,
    /// Seconds to wait for the database connection.
    pub connect_timeout: u64,
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("on_error", "halt")?
            .set_default("timeout", 30_i64)?
            .set_default("teardown", "rollback")?
            .set_default("epsilon", DEFAULT_EPSILON)?
            .set_default("format", "text")?
            .set_default("log_format", "pretty")?
            .set_default("connect_timeout", 10_i64)?
            .add_source(File::with_name("docverify").required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("DOCVERIFY"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Lets explicit command-line flags win over every other source.
    pub fn apply(mut self, cli: &Cli) -> Result<Self> {
        if let Some(dsn) = &cli.dsn {
            self.dsn = Some(dsn.clone());
        }
        if let Some(policy) = cli.on_error {
            self.on_error = policy;
        }
        if let Some(timeout) = cli.timeout {
            self.timeout = timeout;
        }
        if let Some(teardown) = cli.teardown {
            self.teardown = teardown;
        }
        if let Some(epsilon) = cli.epsilon {
            self.epsilon = epsilon;
        }
        if let Some(format) = cli.format {
            self.format = format;
        }
        if let Some(log_format) = cli.log_format {
            self.log_format = log_format;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            policy: self.on_error,
            timeout: Duration::from_secs(self.timeout),
            teardown: self.teardown,
            epsilon: self.epsilon,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            bail!("epsilon must be a non-negative number, got {}", self.epsilon);
        }
        if self.connect_timeout == 0 {
            bail!("connect_timeout must be at least one second");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.on_error, ErrorPolicy::Halt);
        assert_eq!(settings.timeout, 30);
        assert_eq!(settings.teardown, TeardownMode::Rollback);
        assert_eq!(settings.format, OutputFormat::Text);
        assert_eq!(settings.run_options(), RunOptions::default());
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let file = config_file(
            "on_error = \"continue\"\ntimeout = 120\nteardown = \"drop\"\nepsilon = 0.001\nformat = \"json\"\n",
        );
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.on_error, ErrorPolicy::Continue);
        assert_eq!(settings.timeout, 120);
        assert_eq!(settings.teardown, TeardownMode::Drop);
        assert_eq!(settings.epsilon, 0.001);
        assert_eq!(settings.format, OutputFormat::Json);
    }

    #[test]
    fn test_flags_override_config_file() {
        let file = config_file("on_error = \"continue\"\ntimeout = 120\n");
        let cli = Cli::parse_from(["verify", "--doc", "README.md", "--on-error", "halt"]);
        let settings = Settings::load(Some(file.path())).unwrap().apply(&cli).unwrap();
        assert_eq!(settings.on_error, ErrorPolicy::Halt);
        assert_eq!(settings.timeout, 120);
    }

    #[test]
    fn test_missing_explicit_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_negative_epsilon_is_rejected() {
        let file = config_file("epsilon = -1.0\n");
        assert!(Settings::load(Some(file.path())).is_err());
    }
}
