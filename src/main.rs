#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod analytics;
mod cli;
mod config;
mod db;
mod discord;
mod parsers;
mod tracker;
mod utils;

use analytics::{AggregationEngine, ReportOptions};
use cli::Cli;
use config::Config;
use discord::DiscordClient;
use tracker::TrackerCore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load_from_file(&cli.config)?);
    utils::logging::init_tracing(&config.logging);
    info!("emote tracker starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    if cli.drop_tables {
        warn!("dropping all tables");
        db_manager.drop_tables().await?;
    }
    if !cli.skip_migrations {
        db_manager.migrate().await?;
    }
    if cli.wipe_data {
        warn!("wiping all stored data");
        db_manager.wipe_data().await?;
    }
    if cli.reset_crawl {
        info!("resetting channel crawl state");
        db_manager.reset_crawl_state().await?;
    }

    let (event_tx, event_rx) = mpsc::channel(config.tracker.event_queue_capacity);
    let discord_client = Arc::new(DiscordClient::new(config.clone(), event_tx));
    let gateway = discord_client.gateway();

    discord_client.set_engine(Arc::new(AggregationEngine::new(
        db_manager.usage_store(),
        db_manager.emote_store(),
        gateway.clone(),
        ReportOptions {
            default_limit: config.reports.default_limit,
            max_limit: config.reports.max_limit,
        },
    )));

    let tracker = Arc::new(TrackerCore::new(
        &db_manager,
        gateway.clone(),
        gateway,
        &config.tracker,
        &config.discord.command_prefix,
    ));
    let tracker_handle = tokio::spawn(async move {
        if let Err(e) = tracker.run(event_rx).await {
            error!("tracker error: {}", e);
        }
    });

    tokio::select! {
        result = discord_client.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested before discord login completed");
            return Ok(());
        }
    }

    tokio::select! {
        _ = tracker_handle => {},
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }

    discord_client.stop().await?;
    info!("emote tracker shutting down");
    Ok(())
}
