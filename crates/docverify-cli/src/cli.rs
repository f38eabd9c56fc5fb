use clap::Parser;
use docverify_core::{ErrorPolicy, TeardownMode};
use std::path::PathBuf;

use crate::settings::{LogFormat, OutputFormat};

#[derive(Parser, Debug)]
#[command(name = "verify")]
#[command(about = "Verify the SQL examples of a Markdown tutorial against a live database", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Markdown document to verify
    #[arg(long, value_name = "PATH")]
    pub doc: PathBuf,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub dsn: Option<String>,

    /// What to do after a block fails (halt, continue)
    #[arg(long, value_name = "POLICY")]
    pub on_error: Option<ErrorPolicy>,

    /// Per-block timeout in seconds (0 disables it)
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// How side effects are undone (rollback, drop)
    #[arg(long, value_name = "MODE")]
    pub teardown: Option<TeardownMode>,

    /// Report format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Default numeric tolerance for literal rows
    #[arg(long)]
    pub epsilon: Option<f64>,

    /// Run blocks in document order without dependency reordering
    #[arg(long)]
    pub document_order: bool,

    /// Print the execution plan and exit without connecting
    #[arg(long)]
    pub plan_only: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_policy_and_teardown() {
        let cli = Cli::parse_from([
            "verify",
            "--doc",
            "README.md",
            "--on-error",
            "continue",
            "--teardown",
            "drop",
            "--timeout",
            "5",
            "--plan-only",
        ]);
        assert_eq!(cli.doc, PathBuf::from("README.md"));
        assert_eq!(cli.on_error, Some(ErrorPolicy::Continue));
        assert_eq!(cli.teardown, Some(TeardownMode::Drop));
        assert_eq!(cli.timeout, Some(5));
        assert!(cli.plan_only);
        assert!(!cli.document_order);
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["verify", "--doc", "README.md", "--on-error", "retry"]);
        assert!(result.is_err());
    }
}
