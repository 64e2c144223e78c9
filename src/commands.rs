//! CLI commands and the registry that dispatches them.
//!
//! Handlers come in two kinds. [`Command`] runs with the shared [`State`]
//! only; [`UserCommand`] additionally receives the logged-in [`User`], which
//! the [`Registry`] resolves before calling it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{parse_duration, Config, ConfigError};
use crate::db::{Database, RepositoryError, User};
use crate::fetcher::FeedClient;
use crate::scheduler::{ConsoleConsumer, Scheduler};

const DEFAULT_BROWSE_LIMIT: i64 = 2;

/// Shortest interval `agg` accepts between two feed requests.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("usage: gator {0}")]
    Usage(&'static str),

    #[error("no user is logged in; run `gator login <name>` first")]
    NotLoggedIn,
}

/// Everything a command may touch. Replaces any process-wide state.
pub struct State {
    pub db: Arc<Database>,
    pub config: Config,
    config_path: PathBuf,
}

impl State {
    pub fn new(db: Arc<Database>, config: Config, config_path: PathBuf) -> Self {
        Self {
            db,
            config,
            config_path,
        }
    }

    fn set_current_user(&mut self, name: &str) -> Result<(), ConfigError> {
        self.config.set_user(name);
        self.config.save(&self.config_path)
    }

    async fn current_user(&self) -> anyhow::Result<User> {
        let name = self
            .config
            .current_user_name
            .as_deref()
            .ok_or(CommandError::NotLoggedIn)?;
        let user = self
            .db
            .get_user(name)
            .await
            .with_context(|| format!("current user {:?} is not registered", name))?;
        Ok(user)
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn usage(&self) -> &'static str;

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UserCommand: Send + Sync {
    fn usage(&self) -> &'static str;

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()>;
}

pub enum Handler {
    Public(Box<dyn Command>),
    /// Requires a logged-in user.
    Authenticated(Box<dyn UserCommand>),
}

impl Handler {
    pub fn usage(&self) -> &'static str {
        match self {
            Handler::Public(command) => command.usage(),
            Handler::Authenticated(command) => command.usage(),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in command.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("login", Handler::Public(Box::new(Login)));
        registry.register("register", Handler::Public(Box::new(Register)));
        registry.register("reset", Handler::Public(Box::new(Reset)));
        registry.register("users", Handler::Public(Box::new(Users)));
        registry.register("agg", Handler::Public(Box::new(Agg)));
        registry.register("feeds", Handler::Public(Box::new(Feeds)));
        registry.register("addfeed", Handler::Authenticated(Box::new(AddFeed)));
        registry.register("follow", Handler::Authenticated(Box::new(Follow)));
        registry.register("following", Handler::Authenticated(Box::new(Following)));
        registry.register("unfollow", Handler::Authenticated(Box::new(Unfollow)));
        registry.register("browse", Handler::Authenticated(Box::new(Browse)));
        registry
    }

    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    /// One usage line per command, sorted by name.
    pub fn usage(&self) -> String {
        self.handlers
            .values()
            .map(|handler| format!("  gator {}", handler.usage()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn run(&self, state: &mut State, name: &str, args: &[String]) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;

        match handler {
            Handler::Public(command) => command.run(state, args).await,
            Handler::Authenticated(command) => {
                let user = state.current_user().await?;
                command.run(state, &user, args).await
            }
        }
    }
}

struct Login;

#[async_trait]
impl Command for Login {
    fn usage(&self) -> &'static str {
        "login <name>"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        let [name] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };

        state
            .db
            .get_user(name)
            .await
            .with_context(|| format!("cannot log in as {:?}; run `gator register` first", name))?;
        state.set_current_user(name)?;

        println!("User set to {}", name);
        Ok(())
    }
}

struct Register;

#[async_trait]
impl Command for Register {
    fn usage(&self) -> &'static str {
        "register <name>"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        let [name] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };

        let user = state.db.create_user(name).await?;
        state.set_current_user(&user.name)?;
        info!(user_id = user.id, name = %user.name, "registered user");

        println!("User {:?} created", user.name);
        Ok(())
    }
}

struct Reset;

#[async_trait]
impl Command for Reset {
    fn usage(&self) -> &'static str {
        "reset"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        if !args.is_empty() {
            return Err(CommandError::Usage(self.usage()).into());
        }

        let deleted = state.db.reset().await?;
        println!("Reset succeeded, removed {} users", deleted);
        Ok(())
    }
}

struct Users;

#[async_trait]
impl Command for Users {
    fn usage(&self) -> &'static str {
        "users"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        if !args.is_empty() {
            return Err(CommandError::Usage(self.usage()).into());
        }

        let current = state.config.current_user_name.as_deref();
        for user in state.db.get_users().await? {
            if current == Some(user.name.as_str()) {
                println!("* {} (current)", user.name);
            } else {
                println!("* {}", user.name);
            }
        }
        Ok(())
    }
}

struct Agg;

#[async_trait]
impl Command for Agg {
    fn usage(&self) -> &'static str {
        "agg <time_between_reqs>"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        let [raw_interval] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };
        let interval = parse_duration(raw_interval)?;
        if interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::InvalidDuration {
                input: raw_interval.clone(),
                reason: "polling interval must be at least 1s",
            }
            .into());
        }

        let client = FeedClient::new(&state.config.user_agent)
            .context("failed to create HTTP client")?;
        let consumer = (ConsoleConsumer, state.db.clone());
        let mut scheduler = Scheduler::new(
            state.db.clone(),
            Arc::new(client),
            Arc::new(consumer),
            state.config.fetch_timeout(),
        )
        .with_failure_threshold(state.config.repository_failure_threshold);

        println!("Collecting feeds every {:?}", interval);
        scheduler.run_forever(interval, shutdown_signal()).await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c, shutting down");
}

struct Feeds;

#[async_trait]
impl Command for Feeds {
    fn usage(&self) -> &'static str {
        "feeds"
    }

    async fn run(&self, state: &mut State, args: &[String]) -> anyhow::Result<()> {
        if !args.is_empty() {
            return Err(CommandError::Usage(self.usage()).into());
        }

        for feed in state.db.get_feeds().await? {
            println!("* {} ({})", feed.name, feed.url);
            println!("  added by {}", feed.user_name);
            match feed.last_fetched_at {
                Some(at) => println!("  last fetched {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("  never fetched"),
            }
            if let Some(err) = feed.last_fetch_error {
                println!("  last error: {}", err);
            }
        }
        Ok(())
    }
}

struct AddFeed;

#[async_trait]
impl UserCommand for AddFeed {
    fn usage(&self) -> &'static str {
        "addfeed <name> <url>"
    }

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()> {
        let [name, url] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };

        let feed = state.db.create_feed(name, url, user.id).await?;
        state.db.create_feed_follow(user.id, feed.id).await?;
        info!(feed_id = feed.id, url = %feed.url, user = %user.name, "added feed");

        println!("Feed {:?} added ({})", feed.name, feed.url);
        println!("Followed by {}", user.name);
        Ok(())
    }
}

struct Follow;

#[async_trait]
impl UserCommand for Follow {
    fn usage(&self) -> &'static str {
        "follow <url>"
    }

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()> {
        let [url] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };

        let feed = state.db.get_feed_by_url(url).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => {
                anyhow::anyhow!("no feed with URL {}; run `gator addfeed` first", url)
            }
            other => other.into(),
        })?;
        let follow = state.db.create_feed_follow(user.id, feed.id).await?;

        println!("{} ({})", follow.feed_name, follow.user_name);
        Ok(())
    }
}

struct Following;

#[async_trait]
impl UserCommand for Following {
    fn usage(&self) -> &'static str {
        "following"
    }

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()> {
        if !args.is_empty() {
            return Err(CommandError::Usage(self.usage()).into());
        }

        println!("{} follows:", user.name);
        for follow in state.db.get_feed_follows_for_user(user.id).await? {
            println!("* {}", follow.feed_name);
        }
        Ok(())
    }
}

struct Unfollow;

#[async_trait]
impl UserCommand for Unfollow {
    fn usage(&self) -> &'static str {
        "unfollow <url>"
    }

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()> {
        let [url] = args else {
            return Err(CommandError::Usage(self.usage()).into());
        };

        state.db.delete_feed_follow(user.id, url).await?;
        println!("{} unfollowed {}", user.name, url);
        Ok(())
    }
}

struct Browse;

#[async_trait]
impl UserCommand for Browse {
    fn usage(&self) -> &'static str {
        "browse [limit]"
    }

    async fn run(&self, state: &mut State, user: &User, args: &[String]) -> anyhow::Result<()> {
        let limit = match args {
            [] => DEFAULT_BROWSE_LIMIT,
            [limit] => match limit.parse::<i64>() {
                Ok(n) if n > 0 => n,
                _ => return Err(CommandError::Usage(self.usage()).into()),
            },
            _ => return Err(CommandError::Usage(self.usage()).into()),
        };

        for post in state.db.get_posts_for_user(user.id, limit).await? {
            match post.published_at {
                Some(at) => println!("{} from {}", at.format("%a %b %e %Y"), post.feed_name),
                None => println!("from {}", post.feed_name),
            }
            println!("--- {} ---", post.title);
            if !post.description.is_empty() {
                println!("    {}", post.description);
            }
            println!("Link: {}", post.url);
            println!("=====================================");
        }
        Ok(())
    }
}
