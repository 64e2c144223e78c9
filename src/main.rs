use std::sync::Arc;

use anyhow::bail;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::commands::{Registry, State};
use gator::config::{Config, ConfigError};
use gator::db::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let registry = Registry::standard();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        bail!(
            "not enough arguments were provided\nusage:\n{}",
            registry.usage()
        );
    };
    let args: Vec<String> = args.collect();

    // Load configuration
    let config_path = Config::default_path()?;
    let config = Config::load(&config_path)?;
    debug!(path = %config_path.display(), "loaded configuration");

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.db_url.clone());
    if database_url.is_empty() {
        return Err(ConfigError::MissingDatabaseUrl.into());
    }

    // Initialize database
    let db = Database::new(&database_url).await?;
    db.initialize().await?;

    let mut state = State::new(Arc::new(db), config, config_path);
    registry.run(&mut state, &command, &args).await
}
