//! Feed polling scheduler.
//!
//! A single worker repeatedly selects the least recently fetched feed, fetches
//! it under a deadline, records the attempt, and hands the parsed items to an
//! [`ItemConsumer`].
//!
//! Ticks are scheduled at fixed points `start + k * interval`. A tick that
//! overruns its slot is followed at once by the next tick; the slots it
//! overran are dropped and later ticks fall back onto the `start + k * interval`
//! grid. Ticks never overlap or fire in bursts.
//!
//! Shutdown interrupts the timer wait, feed selection and the fetch. Once a
//! fetch has completed, the tick always records it and publishes every item.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{Feed, RepositoryError};
use crate::fetcher::{FetchError, FetchFeed, Item};

#[async_trait]
pub trait FeedRepository: Send + Sync {
    /// The feed with the oldest `last_fetched_at` (never-fetched first), ties broken by id.
    async fn next_feed_to_fetch(&self) -> Result<Option<Feed>, RepositoryError>;

    async fn mark_fetched(&self, feed_id: i64, at: DateTime<Utc>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ItemConsumer: Send + Sync {
    /// Called once per item of a successful fetch, in document order.
    async fn on_item(&self, feed_id: i64, item: &Item);

    /// Called once per failed fetch.
    async fn on_fetch_error(&self, feed_id: i64, error: &FetchError);
}

#[async_trait]
impl<T: ItemConsumer + ?Sized> ItemConsumer for Arc<T> {
    async fn on_item(&self, feed_id: i64, item: &Item) {
        (**self).on_item(feed_id, item).await
    }

    async fn on_fetch_error(&self, feed_id: i64, error: &FetchError) {
        (**self).on_fetch_error(feed_id, error).await
    }
}

/// Fan out to both consumers, first `A` then `B`.
#[async_trait]
impl<A: ItemConsumer, B: ItemConsumer> ItemConsumer for (A, B) {
    async fn on_item(&self, feed_id: i64, item: &Item) {
        self.0.on_item(feed_id, item).await;
        self.1.on_item(feed_id, item).await;
    }

    async fn on_fetch_error(&self, feed_id: i64, error: &FetchError) {
        self.0.on_fetch_error(feed_id, error).await;
        self.1.on_fetch_error(feed_id, error).await;
    }
}

/// Prints item titles to stdout.
pub struct ConsoleConsumer;

#[async_trait]
impl ItemConsumer for ConsoleConsumer {
    async fn on_item(&self, _feed_id: i64, item: &Item) {
        println!("* {}", item.title);
    }

    async fn on_fetch_error(&self, feed_id: i64, error: &FetchError) {
        println!("! feed {}: {}", feed_id, error);
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("polling interval must be greater than zero")]
    ZeroInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The repository holds no feeds.
    NoFeeds,
    Fetched { feed_id: i64, items: usize },
    FetchFailed { feed_id: i64 },
    /// Selecting the next feed failed; nothing was fetched.
    RepositoryFailed,
    /// Shutdown completed before the fetch did; nothing was recorded.
    Cancelled,
}

pub struct Scheduler {
    repository: Arc<dyn FeedRepository>,
    fetcher: Arc<dyn FetchFeed>,
    consumer: Arc<dyn ItemConsumer>,
    fetch_timeout: Duration,
    failure_threshold: u32,
    repository_failures: u32,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn FeedRepository>,
        fetcher: Arc<dyn FetchFeed>,
        consumer: Arc<dyn ItemConsumer>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            fetcher,
            consumer,
            fetch_timeout,
            failure_threshold: 5,
            repository_failures: 0,
        }
    }

    /// Consecutive repository failures after which each further failure is logged at error level.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn consecutive_repository_failures(&self) -> u32 {
        self.repository_failures
    }

    /// Run one select, fetch, record, publish sequence with the configured fetch timeout.
    pub async fn tick(&mut self) -> TickOutcome {
        let never = std::pin::pin!(std::future::pending::<()>());
        self.run_tick(self.fetch_timeout, never).await
    }

    /// Poll feeds every `interval` until `shutdown` completes.
    ///
    /// The first tick runs immediately. Completing `shutdown` while a fetch is
    /// in flight drops that fetch without recording it.
    pub async fn run_forever<F>(&mut self, interval: Duration, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let deadline = self.fetch_deadline(interval);
        info!(?interval, fetch_timeout = ?deadline, "collecting feeds");

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let outcome = self.run_tick(deadline, shutdown.as_mut()).await;
            if outcome == TickOutcome::Cancelled {
                info!("shutdown requested, abandoned in-flight fetch");
                break;
            }
            debug!(?outcome, "tick finished");
        }

        info!("scheduler stopped");
        Ok(())
    }

    // A fetch must finish before the next tick is due.
    fn fetch_deadline(&self, interval: Duration) -> Duration {
        if self.fetch_timeout < interval {
            self.fetch_timeout
        } else {
            let clamped = interval / 2;
            info!(
                configured = ?self.fetch_timeout,
                clamped = ?clamped,
                "fetch timeout is not shorter than the polling interval, clamping"
            );
            clamped
        }
    }

    async fn run_tick<S>(&mut self, deadline: Duration, mut shutdown: Pin<&mut S>) -> TickOutcome
    where
        S: Future<Output = ()>,
    {
        let selected = tokio::select! {
            biased;
            _ = &mut shutdown => return TickOutcome::Cancelled,
            selected = self.repository.next_feed_to_fetch() => selected,
        };

        let feed = match selected {
            Ok(Some(feed)) => {
                self.repository_succeeded();
                feed
            }
            Ok(None) => {
                self.repository_succeeded();
                info!("no feeds to fetch");
                return TickOutcome::NoFeeds;
            }
            Err(e) => {
                self.repository_failed("select next feed", &e);
                return TickOutcome::RepositoryFailed;
            }
        };

        info!(feed_id = feed.id, name = %feed.name, url = %feed.url, "fetching feed");
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => return TickOutcome::Cancelled,
            result = self.fetcher.fetch_feed(&feed.url, deadline) => result,
        };

        // Recorded for failed fetches too; a failing feed moves to the back of the queue.
        match self.repository.mark_fetched(feed.id, Utc::now()).await {
            Ok(()) => self.repository_succeeded(),
            Err(e) => self.repository_failed("mark feed fetched", &e),
        }

        match result {
            Ok(fetched) => {
                for item in &fetched.items {
                    self.consumer.on_item(feed.id, item).await;
                }
                info!(
                    feed_id = feed.id,
                    title = %fetched.title,
                    items = fetched.items.len(),
                    "fetched feed"
                );
                TickOutcome::Fetched {
                    feed_id: feed.id,
                    items: fetched.items.len(),
                }
            }
            Err(e) => {
                warn!(feed_id = feed.id, url = %feed.url, kind = e.kind(), error = %e, "failed to fetch feed");
                self.consumer.on_fetch_error(feed.id, &e).await;
                TickOutcome::FetchFailed { feed_id: feed.id }
            }
        }
    }

    fn repository_succeeded(&mut self) {
        if self.repository_failures > 0 {
            info!(
                after_failures = self.repository_failures,
                "feed repository recovered"
            );
            self.repository_failures = 0;
        }
    }

    fn repository_failed(&mut self, operation: &'static str, error: &RepositoryError) {
        self.repository_failures += 1;
        if self.repository_failures >= self.failure_threshold {
            error!(
                operation,
                consecutive_failures = self.repository_failures,
                error = %error,
                "feed repository appears unreachable"
            );
        } else {
            warn!(
                operation,
                consecutive_failures = self.repository_failures,
                error = %error,
                "feed repository call failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchResult;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn create_test_feed(id: i64) -> Feed {
        let now = Utc::now();
        Feed {
            id,
            created_at: now,
            updated_at: now,
            name: format!("Feed {}", id),
            url: format!("https://feed{}.example.com/rss", id),
            user_id: 1,
            last_fetched_at: None,
            last_fetch_error: None,
        }
    }

    fn create_item(title: &str) -> Item {
        Item {
            title: title.to_string(),
            link: format!("https://example.com/{}", title),
            description: String::new(),
            published: None,
        }
    }

    /// In-memory repository with the same selection order as the database.
    #[derive(Default)]
    struct MemoryRepository {
        feeds: Mutex<Vec<Feed>>,
        marked: Mutex<Vec<i64>>,
        failing: Mutex<bool>,
    }

    impl MemoryRepository {
        fn with_feeds(count: i64) -> Self {
            let repo = Self::default();
            *repo.feeds.lock().unwrap() = (1..=count).map(create_test_feed).collect();
            repo
        }

        fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        fn marked(&self) -> Vec<i64> {
            self.marked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedRepository for MemoryRepository {
        async fn next_feed_to_fetch(&self) -> Result<Option<Feed>, RepositoryError> {
            if *self.failing.lock().unwrap() {
                return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
            }
            let feeds = self.feeds.lock().unwrap();
            Ok(feeds
                .iter()
                .min_by_key(|f| (f.last_fetched_at, f.id))
                .cloned())
        }

        async fn mark_fetched(&self, feed_id: i64, at: DateTime<Utc>) -> Result<(), RepositoryError> {
            let mut feeds = self.feeds.lock().unwrap();
            let feed = feeds
                .iter_mut()
                .find(|f| f.id == feed_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("feed {}", feed_id)))?;
            feed.last_fetched_at = Some(at);
            self.marked.lock().unwrap().push(feed_id);
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Items(usize),
        Fail,
    }

    /// Fetcher that takes `delay` on the tokio clock and answers per URL.
    struct FakeFetcher {
        delay: Duration,
        /// Per-call delays, used in order before falling back to `delay`.
        delays: Vec<Duration>,
        origin: Instant,
        behaviours: HashMap<String, Behaviour>,
        started: Mutex<Vec<Duration>>,
    }

    impl FakeFetcher {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                delays: Vec::new(),
                origin: Instant::now(),
                behaviours: HashMap::new(),
                started: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, feed_id: i64) -> Self {
            self.behaviours
                .insert(create_test_feed(feed_id).url, Behaviour::Fail);
            self
        }

        fn with_delays(mut self, delays: Vec<Duration>) -> Self {
            self.delays = delays;
            self
        }

        fn started(&self) -> Vec<Duration> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FetchFeed for FakeFetcher {
        async fn fetch_feed(&self, url: &str, _deadline: Duration) -> Result<FetchResult, FetchError> {
            let delay = {
                let mut started = self.started.lock().unwrap();
                let delay = self.delays.get(started.len()).copied().unwrap_or(self.delay);
                started.push(self.origin.elapsed());
                delay
            };
            tokio::time::sleep(delay).await;

            match self.behaviours.get(url).copied().unwrap_or(Behaviour::Items(2)) {
                Behaviour::Items(n) => Ok(FetchResult {
                    title: url.to_string(),
                    link: url.to_string(),
                    description: String::new(),
                    items: (1..=n).map(|i| create_item(&format!("item-{}", i))).collect(),
                }),
                Behaviour::Fail => Err(FetchError::Parse("broken feed".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        items: Mutex<Vec<(i64, String)>>,
        errors: Mutex<Vec<(i64, &'static str)>>,
        item_delay: Duration,
    }

    #[async_trait]
    impl ItemConsumer for RecordingConsumer {
        async fn on_item(&self, feed_id: i64, item: &Item) {
            tokio::time::sleep(self.item_delay).await;
            self.items.lock().unwrap().push((feed_id, item.title.clone()));
        }

        async fn on_fetch_error(&self, feed_id: i64, error: &FetchError) {
            self.errors.lock().unwrap().push((feed_id, error.kind()));
        }
    }

    struct Harness {
        repository: Arc<MemoryRepository>,
        fetcher: Arc<FakeFetcher>,
        consumer: Arc<RecordingConsumer>,
        scheduler: Scheduler,
    }

    fn harness(repository: MemoryRepository, fetcher: FakeFetcher) -> Harness {
        harness_with_consumer(repository, fetcher, RecordingConsumer::default())
    }

    fn harness_with_consumer(
        repository: MemoryRepository,
        fetcher: FakeFetcher,
        consumer: RecordingConsumer,
    ) -> Harness {
        let repository = Arc::new(repository);
        let fetcher = Arc::new(fetcher);
        let consumer = Arc::new(consumer);
        let scheduler = Scheduler::new(
            repository.clone(),
            fetcher.clone(),
            consumer.clone(),
            Duration::from_secs(5),
        );
        Harness {
            repository,
            fetcher,
            consumer,
            scheduler,
        }
    }

    mod tick_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_empty_repository_is_a_no_op() {
            let mut h = harness(MemoryRepository::default(), FakeFetcher::new(Duration::ZERO));

            assert_eq!(h.scheduler.tick().await, TickOutcome::NoFeeds);
            assert!(h.fetcher.started().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_successful_tick_publishes_items_in_order() {
            let mut h = harness(MemoryRepository::with_feeds(1), FakeFetcher::new(Duration::ZERO));

            let outcome = h.scheduler.tick().await;

            assert_eq!(outcome, TickOutcome::Fetched { feed_id: 1, items: 2 });
            assert_eq!(
                *h.consumer.items.lock().unwrap(),
                vec![(1, "item-1".to_string()), (1, "item-2".to_string())]
            );
            assert_eq!(h.repository.marked(), vec![1]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_failed_fetch_is_still_recorded() {
            let mut h = harness(
                MemoryRepository::with_feeds(1),
                FakeFetcher::new(Duration::ZERO).failing(1),
            );

            assert_eq!(h.scheduler.tick().await, TickOutcome::FetchFailed { feed_id: 1 });
            assert_eq!(h.repository.marked(), vec![1]);
            assert!(h.consumer.items.lock().unwrap().is_empty());
            assert_eq!(*h.consumer.errors.lock().unwrap(), vec![(1, "parse")]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_failing_feed_does_not_starve_others() {
            let mut h = harness(
                MemoryRepository::with_feeds(3),
                FakeFetcher::new(Duration::from_millis(1)).failing(2),
            );

            for _ in 0..9 {
                h.scheduler.tick().await;
            }

            let marked = h.repository.marked();
            for id in 1..=3 {
                assert_eq!(marked.iter().filter(|&&m| m == id).count(), 3, "feed {}", id);
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_repository_failures_are_counted_and_reset() {
            let mut h = harness(MemoryRepository::with_feeds(1), FakeFetcher::new(Duration::ZERO));
            h.scheduler = h.scheduler.with_failure_threshold(2);

            h.repository.set_failing(true);
            for _ in 0..3 {
                assert_eq!(h.scheduler.tick().await, TickOutcome::RepositoryFailed);
            }
            assert_eq!(h.scheduler.consecutive_repository_failures(), 3);

            h.repository.set_failing(false);
            assert!(matches!(h.scheduler.tick().await, TickOutcome::Fetched { .. }));
            assert_eq!(h.scheduler.consecutive_repository_failures(), 0);
        }
    }

    mod run_forever_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_ticks_on_fixed_schedule() {
            let mut h = harness(
                MemoryRepository::with_feeds(2),
                FakeFetcher::new(Duration::from_millis(10)),
            );

            h.scheduler
                .run_forever(
                    Duration::from_millis(100),
                    tokio::time::sleep(Duration::from_millis(350)),
                )
                .await
                .unwrap();

            let starts: Vec<u128> = h.fetcher.started().iter().map(|d| d.as_millis()).collect();
            assert_eq!(starts, vec![0, 100, 200, 300]);
            assert_eq!(h.repository.marked(), vec![1, 2, 1, 2]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_overrun_skips_missed_ticks() {
            let mut h = harness(
                MemoryRepository::with_feeds(1),
                FakeFetcher::new(Duration::from_millis(250)),
            );

            h.scheduler
                .run_forever(
                    Duration::from_millis(100),
                    tokio::time::sleep(Duration::from_millis(900)),
                )
                .await
                .unwrap();

            // A late tick fires once as soon as the previous one finishes; the
            // overrun slots are dropped rather than fired in a burst.
            let starts: Vec<u128> = h.fetcher.started().iter().map(|d| d.as_millis()).collect();
            assert_eq!(starts, vec![0, 250, 500, 750]);
            // The tick started at 750ms was still fetching at shutdown and is not recorded.
            assert_eq!(h.repository.marked().len(), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn test_shutdown_while_waiting_for_timer() {
            let mut h = harness(MemoryRepository::with_feeds(1), FakeFetcher::new(Duration::ZERO));

            h.scheduler
                .run_forever(
                    Duration::from_secs(3600),
                    tokio::time::sleep(Duration::from_millis(10)),
                )
                .await
                .unwrap();

            assert_eq!(h.fetcher.started().len(), 1);
            assert_eq!(h.repository.marked(), vec![1]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_shutdown_during_fetch_abandons_it() {
            let mut h = harness(
                MemoryRepository::with_feeds(1),
                FakeFetcher::new(Duration::from_secs(3)),
            );
            let origin = Instant::now();

            h.scheduler
                .run_forever(
                    Duration::from_secs(60),
                    tokio::time::sleep(Duration::from_millis(500)),
                )
                .await
                .unwrap();

            assert_eq!(origin.elapsed(), Duration::from_millis(500));
            assert!(h.repository.marked().is_empty());
            assert!(h.consumer.items.lock().unwrap().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_overrun_returns_to_fixed_grid() {
            let fetcher = FakeFetcher::new(Duration::from_millis(10))
                .with_delays(vec![Duration::from_millis(250)]);
            let mut h = harness(MemoryRepository::with_feeds(1), fetcher);

            h.scheduler
                .run_forever(
                    Duration::from_millis(100),
                    tokio::time::sleep(Duration::from_millis(450)),
                )
                .await
                .unwrap();

            // The slow first fetch drops the slots at 100 and 200; later ticks
            // land on the original 100ms grid again.
            let starts: Vec<u128> = h.fetcher.started().iter().map(|d| d.as_millis()).collect();
            assert_eq!(starts, vec![0, 250, 300, 400]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_zero_interval_is_rejected() {
            let mut h = harness(MemoryRepository::with_feeds(1), FakeFetcher::new(Duration::ZERO));

            let result = h
                .scheduler
                .run_forever(Duration::ZERO, std::future::pending())
                .await;

            assert!(matches!(result, Err(SchedulerError::ZeroInterval)));
            assert!(h.fetcher.started().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_shutdown_after_fetch_publishes_every_item() {
            let consumer = RecordingConsumer {
                item_delay: Duration::from_millis(100),
                ..Default::default()
            };
            let mut h = harness_with_consumer(
                MemoryRepository::with_feeds(1),
                FakeFetcher::new(Duration::ZERO),
                consumer,
            );
            let origin = Instant::now();

            h.scheduler
                .run_forever(
                    Duration::from_secs(60),
                    tokio::time::sleep(Duration::from_millis(50)),
                )
                .await
                .unwrap();

            assert_eq!(origin.elapsed(), Duration::from_millis(200));
            assert_eq!(
                *h.consumer.items.lock().unwrap(),
                vec![(1, "item-1".to_string()), (1, "item-2".to_string())]
            );
            assert_eq!(h.repository.marked(), vec![1]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_empty_repository_keeps_running() {
            let mut h = harness(MemoryRepository::default(), FakeFetcher::new(Duration::ZERO));

            h.scheduler
                .run_forever(
                    Duration::from_millis(100),
                    tokio::time::sleep(Duration::from_millis(450)),
                )
                .await
                .unwrap();

            assert!(h.fetcher.started().is_empty());
        }
    }

    #[tokio::test]
    async fn test_fetch_deadline_is_shorter_than_interval() {
        let h = harness(MemoryRepository::default(), FakeFetcher::new(Duration::ZERO));

        assert_eq!(
            h.scheduler.fetch_deadline(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
        assert_eq!(
            h.scheduler.fetch_deadline(Duration::from_secs(4)),
            Duration::from_secs(2)
        );
    }
}
