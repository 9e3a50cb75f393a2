//! Scrape scheduling: one select-claim-fetch cycle, and worker loops that
//! repeat it on an interval.
//!
//! The store is the only point of coordination between workers. Each cycle
//! claims its feed with [`Database::claim_next_feed`], which stamps
//! `last_fetched_at` *before* the network call, so a slow or failing feed is
//! not picked again until every other feed has had a turn.

use crate::feed::fetcher::{fetch_feed, FetchError, DEFAULT_FETCH_TIMEOUT};
use crate::feed::parser::RssItem;
use crate::storage::{now_millis, Database, DatabaseError, Feed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Result of one scrape cycle.
#[derive(Debug)]
pub enum ScrapeOutcome {
    /// The store has no feeds.
    Idle,
    /// The claimed feed was fetched; items are in document order.
    Fetched { feed: Feed, items: Vec<RssItem> },
    /// The claimed feed could not be fetched. The claim stands.
    Failed { feed: Feed, error: FetchError },
}

/// Settings for [`run_workers`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub workers: usize,
    pub every: Duration,
    pub fetch_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            every: Duration::from_secs(60),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Run one scrape cycle against the least recently fetched feed.
///
/// Fetch failures are reported as [`ScrapeOutcome::Failed`], never as `Err`;
/// only store errors during the claim propagate.
pub async fn scrape_once(
    db: &Database,
    client: &reqwest::Client,
    fetch_timeout: Duration,
) -> Result<ScrapeOutcome, DatabaseError> {
    let Some(feed) = db.claim_next_feed(now_millis()).await? else {
        tracing::debug!("No feeds to fetch");
        return Ok(ScrapeOutcome::Idle);
    };

    match fetch_feed(client, &feed.url, fetch_timeout).await {
        Ok(rss) => {
            tracing::info!(
                feed_id = feed.id,
                feed = %feed.url,
                items = rss.items.len(),
                "Fetched feed"
            );
            Ok(ScrapeOutcome::Fetched {
                feed,
                items: rss.items,
            })
        }
        Err(error) => {
            tracing::warn!(
                feed_id = feed.id,
                feed = %feed.url,
                stage = %error.stage(),
                error = %error,
                "Feed fetch failed"
            );
            Ok(ScrapeOutcome::Failed { feed, error })
        }
    }
}

/// Resolve once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run `settings.workers` scrape loops until `shutdown` flips to `true`.
///
/// Each worker runs [`scrape_once`] on its own interval; the first tick fires
/// immediately. Every cycle result is handed to `on_outcome` together with
/// the worker index. A cycle in flight when shutdown arrives is dropped; its
/// claim has already been recorded, so the store stays consistent.
pub async fn run_workers<F>(
    db: Database,
    client: reqwest::Client,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
    on_outcome: F,
) where
    F: Fn(usize, Result<ScrapeOutcome, DatabaseError>) + Send + Sync + 'static,
{
    let on_outcome = Arc::new(on_outcome);
    let workers = settings.workers.max(1);

    tracing::info!(
        workers = workers,
        every = ?settings.every,
        "Starting scrape workers"
    );

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let db = db.clone();
            let client = client.clone();
            let mut shutdown = shutdown.clone();
            let on_outcome = Arc::clone(&on_outcome);

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(settings.every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = interval.tick() => {}
                    }

                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break,
                        result = scrape_once(&db, &client, settings.fetch_timeout) => {
                            on_outcome(worker, result);
                        }
                    }
                }

                tracing::debug!(worker = worker, "Scrape worker stopped");
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Scrape worker panicked");
        }
    }

    tracing::info!("Scrape workers stopped");
}
