mod ai;
mod error;
mod integrations;
mod mail_reader;
mod models;
mod search;
mod settings;
mod store;
mod sync;
mod web;

#[cfg(test)]
mod tests;

use clap::{Arg, Command};
use log::warn;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

fn setup_logging() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_logging()?;

    let matches = Command::new("onebox")
        .about("Multi-account IMAP aggregator with search, AI categorization and webhooks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("settings.yaml"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("settings.yaml");
    let config = settings::load_settings(Path::new(config_path))?;

    let db = store::Database::connect(&config.database.url).await?;

    let ai = Arc::new(ai::AiService::new(config.ai.clone(), db.clone())?);
    let search = Arc::new(search::SearchService::new(config.search.clone(), db.clone())?);
    if let Err(e) = search.ensure_index().await {
        warn!("Cannot prepare search index, queries will use the database: {}", e);
    }

    let transport = Arc::new(integrations::HttpWebhookTransport::new()?);
    let webhooks = Arc::new(integrations::WebhookDispatcher::new(db.clone(), transport));

    let pipeline =
        sync::pipeline::FanoutPipeline::new(db.clone(), ai.clone(), search.clone(), webhooks);
    let engine = Arc::new(sync::SyncEngine::new(
        db.clone(),
        Arc::new(mail_reader::imap::ImapConnector),
        pipeline,
    ));

    // Periodic fleet sync in the background, API in the foreground
    sync::entrypoint(engine.clone(), config.sync.days, config.sync.interval_seconds).await?;

    let state = Arc::new(web::AppState {
        db,
        engine,
        ai,
        search,
        sync_days: config.sync.days,
    });
    web::entrypoint(state, &config.server.host, config.server.port).await?;

    Ok(())
}
