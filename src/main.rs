//! tagpin - digest pin store inspector
//!
//! CLI entry point for inspecting and validating the durable pin store
//! that workflow pinners write to.

use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use tracing::info;

use tagpin::cli::{Cli, Command};
use tagpin::config::Config;
use tagpin::domain::{Digest, ImageRef};
use tagpin::store::{DigestStore, JsonlDigestStore, PinnedRow};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store_path = cli.store_path.unwrap_or(config.store_path);

    info!(store_path = %store_path.display(), "tagpin starting");

    let store = JsonlDigestStore::new(&store_path);

    match cli.command {
        Command::Pins { workflow_id } => cmd_pins(&store, &workflow_id).await,
        Command::Check { workflow_id } => cmd_check(&store, workflow_id.as_deref()).await,
        Command::Workflows => cmd_workflows(&store).await,
    }
}

/// Render a row timestamp as UTC date-time
fn render_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Show a workflow's pins exactly as rehydration would: duplicates
/// resolved last-write-wins
async fn cmd_pins(store: &JsonlDigestStore, workflow_id: &str) -> Result<()> {
    let rows = store.load(workflow_id).await.context("Failed to read pin store")?;

    if rows.is_empty() {
        println!("No pins for workflow {}", workflow_id.cyan());
        return Ok(());
    }

    let mut latest: Vec<PinnedRow> = Vec::new();
    for row in rows {
        latest.retain(|r| r.tag != row.tag);
        latest.push(row);
    }
    latest.sort_by(|a, b| a.tag.cmp(&b.tag));

    println!("Workflow: {}", workflow_id.cyan());
    for row in latest {
        println!(
            "  {} {} {}",
            row.tag.yellow(),
            row.digest,
            render_timestamp(row.created_at).dimmed()
        );
    }

    Ok(())
}

/// Validate that stored rows would survive rehydration
async fn cmd_check(store: &JsonlDigestStore, workflow_id: Option<&str>) -> Result<()> {
    let rows = match workflow_id {
        Some(id) => store.load(id).await,
        None => store.rows().await,
    }
    .context("Failed to read pin store")?;

    let mut malformed = 0usize;
    for row in &rows {
        let mut problems = Vec::new();
        if let Err(e) = row.tag.parse::<ImageRef>() {
            problems.push(e.to_string());
        }
        if let Err(e) = Digest::parse_canonical(&row.digest) {
            problems.push(e.to_string());
        }
        if !problems.is_empty() {
            malformed += 1;
            println!(
                "{} row {} (workflow {}): {}",
                "✗".red(),
                row.id.dimmed(),
                row.workflow_id.cyan(),
                problems.join("; ")
            );
        }
    }

    if malformed > 0 {
        bail!(
            "{} of {} rows would fail rehydration and make a restart terminal",
            malformed,
            rows.len()
        );
    }

    println!("{} {} rows ok", "✓".green(), rows.len());
    Ok(())
}

/// List workflow ids present in the store with their row counts
async fn cmd_workflows(store: &JsonlDigestStore) -> Result<()> {
    let rows = store.rows().await.context("Failed to read pin store")?;

    if rows.is_empty() {
        println!("Store is empty");
        return Ok(());
    }

    let ids = store.workflows().await?;
    for id in ids {
        let count = rows.iter().filter(|r| r.workflow_id == id).count();
        println!("{} ({} rows)", id.cyan(), count);
    }

    Ok(())
}
