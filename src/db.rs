use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fetcher::{FetchError, Item};
use crate::scheduler::{FeedRepository, ItemConsumer};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_fetch_error: Option<String>,
}

/// A feed joined with the name of the user who added it.
#[derive(Debug, Clone, FromRow)]
pub struct FeedListing {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_name: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_fetch_error: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub feed_id: i64,
    pub feed_name: String,
    pub title: String,
    pub url: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

// Fixed-width UTC text keeps lexical order equal to chronological order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn on_conflict(what: String) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |err| match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            RepositoryError::Conflict(what)
        }
        _ => RepositoryError::Database(err),
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, RepositoryError> {
        // A single connection keeps `sqlite::memory:` databases shared across queries.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                last_fetched_at TEXT,
                last_fetch_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched
            ON feeds(last_fetched_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT NOT NULL,
                published_at TEXT,
                UNIQUE(feed_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_user(&self, name: &str) -> Result<User, RepositoryError> {
        let now = timestamp(Utc::now());
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (created_at, updated_at, name)
            VALUES (?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(on_conflict(format!("user {:?}", name)))?;
        Ok(user)
    }

    pub async fn get_user(&self, name: &str) -> Result<User, RepositoryError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("user {:?}", name)))
    }

    pub async fn get_users(&self) -> Result<Vec<User>, RepositoryError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    /// Delete every user; feeds, follows and posts go with them.
    pub async fn reset(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM users")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        user_id: i64,
    ) -> Result<Feed, RepositoryError> {
        let now = timestamp(Utc::now());
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(on_conflict(format!("feed {}", url)))?;
        Ok(feed)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, RepositoryError> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Feed, RepositoryError> {
        sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("feed {}", url)))
    }

    pub async fn get_feeds(&self) -> Result<Vec<FeedListing>, RepositoryError> {
        let feeds = sqlx::query_as::<_, FeedListing>(
            r#"
            SELECT feeds.id, feeds.name, feeds.url, users.name AS user_name,
                   feeds.last_fetched_at, feeds.last_fetch_error
            FROM feeds
            JOIN users ON users.id = feeds.user_id
            ORDER BY feeds.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn create_feed_follow(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<FeedFollow, RepositoryError> {
        let now = timestamp(Utc::now());
        let (follow_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await
        .map_err(on_conflict(format!("follow of feed {}", feed_id)))?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT feed_follows.id, feed_follows.created_at, feed_follows.user_id,
                   feed_follows.feed_id, users.name AS user_name, feeds.name AS feed_name
            FROM feed_follows
            JOIN users ON users.id = feed_follows.user_id
            JOIN feeds ON feeds.id = feed_follows.feed_id
            WHERE feed_follows.id = ?
            "#,
        )
        .bind(follow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(follow)
    }

    pub async fn get_feed_follows_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<FeedFollow>, RepositoryError> {
        let follows = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT feed_follows.id, feed_follows.created_at, feed_follows.user_id,
                   feed_follows.feed_id, users.name AS user_name, feeds.name AS feed_name
            FROM feed_follows
            JOIN users ON users.id = feed_follows.user_id
            JOIN feeds ON feeds.id = feed_follows.feed_id
            WHERE feed_follows.user_id = ?
            ORDER BY feeds.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    pub async fn delete_feed_follow(
        &self,
        user_id: i64,
        feed_url: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_follows
            WHERE user_id = ?
              AND feed_id = (SELECT id FROM feeds WHERE url = ?)
            "#,
        )
        .bind(user_id)
        .bind(feed_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("follow of feed {}", feed_url)));
        }
        Ok(())
    }

    /// Store an item keyed by `(feed_id, url)`; a repeated item updates the existing post.
    pub async fn upsert_post(&self, feed_id: i64, item: &Item) -> Result<(), RepositoryError> {
        let now = timestamp(Utc::now());
        let published = item.published.map(timestamp);

        sqlx::query(
            r#"
            INSERT INTO posts (created_at, updated_at, feed_id, title, url, description, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, url) DO UPDATE SET
                updated_at = excluded.updated_at,
                title = excluded.title,
                description = excluded.description,
                published_at = excluded.published_at
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(feed_id)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.description)
        .bind(published)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent posts from the feeds `user_id` follows.
    pub async fn get_posts_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Post>, RepositoryError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT posts.id, posts.created_at, posts.updated_at, posts.feed_id,
                   feeds.name AS feed_name, posts.title, posts.url, posts.description,
                   posts.published_at
            FROM posts
            JOIN feeds ON feeds.id = posts.feed_id
            JOIN feed_follows ON feed_follows.feed_id = posts.feed_id
            WHERE feed_follows.user_id = ?
            ORDER BY posts.published_at DESC NULLS LAST, posts.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn record_fetch_error(
        &self,
        feed_id: i64,
        error: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET last_fetch_error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FeedRepository for Database {
    async fn next_feed_to_fetch(&self) -> Result<Option<Feed>, RepositoryError> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Also clears `last_fetch_error`; a failed fetch sets it again afterwards.
    async fn mark_fetched(&self, feed_id: i64, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let at = timestamp(at);
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = ?, updated_at = ?, last_fetch_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(&at)
        .bind(&at)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("feed {}", feed_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemConsumer for Database {
    async fn on_item(&self, feed_id: i64, item: &Item) {
        if item.link.is_empty() {
            debug!(feed_id, title = %item.title, "skipping item without a link");
            return;
        }
        if let Err(e) = self.upsert_post(feed_id, item).await {
            warn!(feed_id, url = %item.link, error = %e, "failed to store post");
        }
    }

    async fn on_fetch_error(&self, feed_id: i64, error: &FetchError) {
        if let Err(e) = self.record_fetch_error(feed_id, &error.to_string()).await {
            warn!(feed_id, error = %e, "failed to record fetch error");
        }
    }
}
