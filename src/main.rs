use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use janitor::{
    JanitorContext, JanitorService, PgDatabaseCatalog, PgRegistry, ReconciliationEngine,
    SystemProcessTable,
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "runbot-janitor")]
#[command(about = "Runbot janitor - reclaims databases, processes and workspaces of orphaned builds")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<JanitorCommands>,
}

#[derive(Subcommand)]
enum JanitorCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for JanitorCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn build_engine(config: &Configuration) -> Result<ReconciliationEngine> {
    let context =
        JanitorContext::from_config(config).context("Failed to resolve janitor context")?;

    let registry = PgRegistry::connect(&config.registry.dsn, config.registry.root.clone())
        .await
        .context("Failed to connect to build registry")?;
    let catalog = PgDatabaseCatalog::connect(&config.database.admin_dsn)
        .await
        .context("Failed to connect to database server")?;

    log::info!(
        "Janitor context: owner={}, excluded databases={:?}, dry run={}",
        context.owner,
        context.excluded_databases,
        context.dry_run
    );

    Ok(ReconciliationEngine::new(
        context,
        Arc::new(registry),
        Arc::new(catalog),
        Arc::new(SystemProcessTable::new()),
    ))
}

async fn run_once(engine: &ReconciliationEngine, config: &Configuration) -> Result<()> {
    let recovered = engine
        .force_stale_to_done(config.janitor.staleness_window)
        .await
        .context("Stale build recovery failed")?;
    if recovered > 0 {
        log::info!("Marked {recovered} stale builds as done");
    }

    let report = engine
        .run_cleanup_pass()
        .await
        .context("Cleanup pass failed")?;

    let json =
        serde_json::to_string_pretty(&report).context("Failed to serialize pass report")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    let JanitorCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;

    log::info!("Loaded configuration:");
    log::info!("  Registry DSN: {}", config.registry.dsn);
    log::info!("  Build directory: {}", config.build_dir().display());

    let engine = build_engine(&config).await?;

    if matches!(common_cmd, CommonCommands::RunOnce) {
        return run_once(&engine, &config).await;
    }

    log::info!("Starting runbot janitor");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = JanitorService::new(
        Arc::new(engine),
        config.janitor.interval,
        config.janitor.staleness_window,
    );
    let service_task = tokio::spawn(service.run(shutdown_rx));

    log::info!("Janitor running, waiting for shutdown signal");
    wait_for_shutdown_signal().await?;

    log::info!("Received shutdown signal, stopping janitor");
    // the service task may already have exited and dropped its receiver
    let _ = shutdown_tx.send(true);
    service_task.await.context("Janitor service task panicked")?;

    log::info!("Runbot janitor stopped");
    Ok(())
}
