use anyhow::{anyhow, Context, Result};
use docverify_core::{extract, link, Block, ExecutionPlan, Report, Verifier, EXIT_OK};
use docverify_db::PgSession;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

use crate::cli::Cli;
use crate::settings::{OutputFormat, Settings};

#[derive(Serialize)]
struct PlanView<'a> {
    document: String,
    blocks: &'a [Block],
    plan: &'a ExecutionPlan,
}

/// Runs the verification and returns the process exit status.
pub async fn execute(cli: &Cli, settings: &Settings) -> Result<u8> {
    let document = std::fs::read_to_string(&cli.doc)
        .with_context(|| format!("failed to read {}", cli.doc.display()))?;
    let name = cli.doc.display().to_string();

    let blocks = extract(&document)?;
    let plan = if cli.document_order {
        ExecutionPlan::document_order(&blocks)
    } else {
        link(&blocks)?
    };
    tracing::info!("Extracted {} blocks from {}", blocks.len(), name);

    if cli.plan_only {
        let output = match settings.format {
            OutputFormat::Text => render_plan(&name, &blocks, &plan),
            OutputFormat::Json => serde_json::to_string_pretty(&PlanView {
                document: name,
                blocks: &blocks,
                plan: &plan,
            })?,
        };
        println!("{}", output.trim_end());
        return Ok(EXIT_OK);
    }

    let dsn = settings
        .dsn
        .as_deref()
        .ok_or_else(|| anyhow!("no database to verify against: pass --dsn or set DATABASE_URL"))?;

    tracing::info!("Connecting to database");
    let mut session = PgSession::connect(dsn, Duration::from_secs(settings.connect_timeout))
        .await
        .context("failed to connect to database")?;
    match session.server_version().await {
        Ok(version) => tracing::info!("Connected to PostgreSQL {}", version),
        Err(e) => tracing::debug!("Could not read server version: {}", e),
    }

    let mut verifier = Verifier::new(session, settings.run_options());
    let outcome = verifier.run(&blocks, &plan, shutdown_signal()).await?;
    verifier.into_session().close().await;

    let report = Report::build(&name, &blocks, &plan, &outcome);
    match settings.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(report.exit_code())
}

fn render_plan(name: &str, blocks: &[Block], plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Execution plan for {} ({} blocks{})",
        name,
        plan.order.len(),
        if plan.is_reordered() { ", reordered" } else { "" }
    );

    for (step, &index) in plan.order.iter().enumerate() {
        let Some(block) = blocks.get(index) else {
            continue;
        };
        let _ = writeln!(
            out,
            "{:>4}. block {:>3}  line {:>4}  {:<7} {}",
            step + 1,
            block.index,
            block.line,
            block.kind.as_str(),
            block.excerpt()
        );
        if !block.defines.is_empty() {
            let defines: Vec<String> = block.defines.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(out, "        defines {}", defines.join(", "));
        }
        let deps = plan.dependencies_of(index);
        if !deps.is_empty() {
            let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(out, "        after block {}", deps.join(", "));
        }
        if let Some(reason) = &block.skip {
            let _ = writeln!(out, "        skipped: {}", reason);
        }
    }
    out
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Received Ctrl+C, cancelling run"),
        _ = terminate => tracing::warn!("Received SIGTERM, cancelling run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lists_reordered_blocks_with_dependencies() {
        let doc = "```sql\nSELECT * FROM mvw_precinct;\n```\n\n```sql\nCREATE MATERIALIZED VIEW mvw_precinct AS SELECT 1 AS precinct;\n```\n";
        let blocks = extract(doc).unwrap();
        let plan = link(&blocks).unwrap();
        let text = render_plan("README.md", &blocks, &plan);

        assert!(text.starts_with("Execution plan for README.md (2 blocks, reordered)"));
        assert!(text.contains("defines materialized view mvw_precinct"));
        assert!(text.contains("after block 1"));
        let create = text.find("CREATE MATERIALIZED VIEW").unwrap();
        let select = text.find("SELECT * FROM mvw_precinct").unwrap();
        assert!(create < select);
    }

    #[tokio::test]
    async fn test_plan_only_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("README.md");
        std::fs::write(&path, "```sql\nSELECT 1;\n```\n").unwrap();

        let cli = <Cli as clap::Parser>::parse_from([
            "verify",
            "--doc",
            path.to_str().unwrap(),
            "--plan-only",
            "--dsn",
            "postgres://nobody@127.0.0.1:1/none",
        ]);
        let settings = Settings::load(None).unwrap().apply(&cli).unwrap();
        assert_eq!(execute(&cli, &settings).await.unwrap(), EXIT_OK);
    }

    #[tokio::test]
    async fn test_cycle_is_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("README.md");
        std::fs::write(
            &path,
            "```sql\nCREATE VIEW a AS SELECT * FROM b;\nCREATE VIEW b AS SELECT * FROM a;\n```\n",
        )
        .unwrap();

        let cli = <Cli as clap::Parser>::parse_from(["verify", "--doc", path.to_str().unwrap()]);
        let settings = Settings::load(None).unwrap().apply(&cli).unwrap();
        let err = execute(&cli, &settings).await.unwrap_err();
        assert!(err.to_string().contains("Dependency cycle detected between blocks 0, 1"));
    }
}
