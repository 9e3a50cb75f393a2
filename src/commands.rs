//! CLI subcommands and their handlers.
//!
//! Handlers write their display output to a caller-supplied writer, so the
//! binary passes stdout and tests pass a `Vec<u8>`.
use crate::config::{ConfigError, Session};
use crate::feed::{run_workers, scrape_once, ScrapeOutcome, WorkerSettings};
use crate::storage::{Database, DatabaseError, Feed, User};
use crate::util::{strip_control_chars, validate_url, UrlValidationError};
use clap::Subcommand;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

const SEPARATOR: &str = "==================================================";

// ============================================================================
// Command Definitions
// ============================================================================

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a user and log in as them
    Register { name: String },

    /// Switch the current user
    Login { name: String },

    /// Delete every user, feed and follow
    Reset,

    /// List registered users
    Users,

    /// Add a feed and follow it as the current user
    Addfeed { name: String, url: String },

    /// List every feed with its owner
    Feeds,

    /// Follow an existing feed by URL
    Follow { url: String },

    /// List the feeds the current user follows
    Following,

    /// Stop following a feed
    Unfollow { url: String },

    /// Fetch the least recently fetched feed, once or on an interval
    Agg {
        /// Repeat every interval (e.g. 30s, 1m, "1h 30m") until interrupted
        #[arg(long, value_parser = humantime::parse_duration)]
        every: Option<Duration>,

        /// Number of concurrent scrape workers (with --every)
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Time budget for each fetch, request and body together
        #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
        timeout: Duration,
    },
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("not logged in: run `gator register <name>` or `gator login <name>` first")]
    NotLoggedIn,

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error("couldn't update session: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

// ============================================================================
// State
// ============================================================================

/// Everything a command needs: session, store, HTTP client and the shutdown
/// signal for long-running aggregation.
pub struct State {
    pub session: Session,
    pub db: Database,
    pub client: reqwest::Client,
    pub shutdown: watch::Receiver<bool>,
}

impl State {
    /// Resolve the logged-in user against the store.
    async fn current_user(&self) -> Result<User, CommandError> {
        let name = self.session.current_user().ok_or(CommandError::NotLoggedIn)?;
        Ok(self.db.get_user(name).await?)
    }
}

/// The URL form feeds are stored under: parsed and re-serialized when it
/// parses, trimmed otherwise.
fn canonical_url(input: &str) -> String {
    let trimmed = input.trim();
    url::Url::parse(trimmed)
        .map(String::from)
        .unwrap_or_else(|_| trimmed.to_string())
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_feed<W: Write>(out: &mut W, feed: &Feed, owner: &str) -> std::io::Result<()> {
    writeln!(out, " * ID:            {}", feed.id)?;
    writeln!(out, " * Created:       {}", format_timestamp(feed.created_at))?;
    writeln!(out, " * Updated:       {}", format_timestamp(feed.updated_at))?;
    writeln!(out, " * Name:          {}", strip_control_chars(&feed.name))?;
    writeln!(out, " * URL:           {}", feed.url)?;
    writeln!(out, " * User:          {}", strip_control_chars(owner))?;
    match feed.last_fetched_at {
        Some(at) => writeln!(out, " * Last fetched:  {}", format_timestamp(at)),
        None => writeln!(out, " * Last fetched:  never"),
    }
}

fn print_outcome<W: Write>(out: &mut W, outcome: &ScrapeOutcome) -> std::io::Result<()> {
    match outcome {
        ScrapeOutcome::Idle => writeln!(out, "No feeds to fetch."),
        ScrapeOutcome::Fetched { feed, items } => {
            writeln!(out, "Feed: {} ({})", strip_control_chars(&feed.name), feed.url)?;
            writeln!(out, "Feed Item Titles:")?;
            for item in items {
                writeln!(out, "- {}", strip_control_chars(&item.title))?;
            }
            Ok(())
        }
        ScrapeOutcome::Failed { feed, error } => writeln!(
            out,
            "Error fetching {} ({} stage): {}",
            feed.url,
            error.stage(),
            error
        ),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run one command, writing its display output to `out`.
pub async fn run<W: Write>(
    command: Command,
    state: &mut State,
    out: &mut W,
) -> Result<(), CommandError> {
    match command {
        Command::Register { name } => register(state, out, &name).await,
        Command::Login { name } => login(state, out, &name).await,
        Command::Reset => reset(state, out).await,
        Command::Users => users(state, out).await,
        Command::Addfeed { name, url } => add_feed(state, out, &name, &url).await,
        Command::Feeds => feeds(state, out).await,
        Command::Follow { url } => follow(state, out, &url).await,
        Command::Following => following(state, out).await,
        Command::Unfollow { url } => unfollow(state, out, &url).await,
        Command::Agg {
            every,
            workers,
            timeout,
        } => aggregate(state, out, every, workers, timeout).await,
    }
}

// ============================================================================
// Users
// ============================================================================

async fn register<W: Write>(state: &mut State, out: &mut W, name: &str) -> Result<(), CommandError> {
    let user = state.db.create_user(name).await?;
    state.session.set_user(&user.name)?;

    writeln!(out, "user was created:")?;
    writeln!(out, " * ID:   {}", user.id)?;
    writeln!(out, " * Name: {}", user.name)?;
    Ok(())
}

async fn login<W: Write>(state: &mut State, out: &mut W, name: &str) -> Result<(), CommandError> {
    let user = state.db.get_user(name.trim()).await?;
    state.session.set_user(&user.name)?;

    writeln!(out, "user has been set: {}", user.name)?;
    Ok(())
}

async fn reset<W: Write>(state: &mut State, out: &mut W) -> Result<(), CommandError> {
    let removed = state.db.delete_all_users().await?;
    tracing::info!(users = removed, "Database reset");

    writeln!(out, "successfully reset database! ({} users removed)", removed)?;
    Ok(())
}

async fn users<W: Write>(state: &mut State, out: &mut W) -> Result<(), CommandError> {
    let current = state.session.current_user();
    for user in state.db.list_users().await? {
        if Some(user.name.as_str()) == current {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

// ============================================================================
// Feeds
// ============================================================================

async fn add_feed<W: Write>(
    state: &mut State,
    out: &mut W,
    name: &str,
    url: &str,
) -> Result<(), CommandError> {
    let user = state.current_user().await?;
    let url = validate_url(url)?;

    let (feed, follow) = state
        .db
        .create_feed_with_follow(name, url.as_str(), user.id)
        .await?;

    writeln!(out, "Feed created successfully:")?;
    print_feed(out, &feed, &user.name)?;
    writeln!(out)?;
    writeln!(out, "Feed followed successfully!")?;
    writeln!(out, "Username: {}", follow.user_name)?;
    writeln!(out, "Feed name: {}", strip_control_chars(&follow.feed_name))?;
    writeln!(out, "{SEPARATOR}")?;
    Ok(())
}

async fn feeds<W: Write>(state: &mut State, out: &mut W) -> Result<(), CommandError> {
    let feeds = state.db.list_feeds().await?;
    if feeds.is_empty() {
        writeln!(out, "No feeds found.")?;
        return Ok(());
    }

    writeln!(out, "Found {} feeds:", feeds.len())?;
    for entry in &feeds {
        print_feed(out, &entry.feed, &entry.owner_name)?;
        writeln!(out, "{SEPARATOR}")?;
    }
    Ok(())
}

// ============================================================================
// Follows
// ============================================================================

async fn follow<W: Write>(state: &mut State, out: &mut W, url: &str) -> Result<(), CommandError> {
    let user = state.current_user().await?;
    let feed = state.db.get_feed_by_url(&canonical_url(url)).await?;
    let follow = state.db.create_follow(user.id, feed.id).await?;

    writeln!(out, "Feed followed successfully!")?;
    writeln!(out, "Username: {}", follow.user_name)?;
    writeln!(out, "Feed name: {}", strip_control_chars(&follow.feed_name))?;
    writeln!(out, "{SEPARATOR}")?;
    Ok(())
}

async fn following<W: Write>(state: &mut State, out: &mut W) -> Result<(), CommandError> {
    let user = state.current_user().await?;
    let follows = state.db.list_follows_for_user(user.id).await?;

    writeln!(out, "Current username: {}", user.name)?;
    if follows.is_empty() {
        writeln!(out, "Not following any feeds.")?;
        return Ok(());
    }
    writeln!(out, "Feed names:")?;
    for followed in &follows {
        writeln!(out, "- {}", strip_control_chars(&followed.feed_name))?;
    }
    Ok(())
}

async fn unfollow<W: Write>(state: &mut State, out: &mut W, url: &str) -> Result<(), CommandError> {
    let user = state.current_user().await?;
    let feed = state.db.get_feed_by_url(&canonical_url(url)).await?;
    state.db.delete_follow(user.id, feed.id).await?;

    writeln!(
        out,
        "{} unfollowed {}",
        user.name,
        strip_control_chars(&feed.name)
    )?;
    Ok(())
}

// ============================================================================
// Aggregation
// ============================================================================

async fn aggregate<W: Write>(
    state: &mut State,
    out: &mut W,
    every: Option<Duration>,
    workers: usize,
    timeout: Duration,
) -> Result<(), CommandError> {
    const USAGE: &str = "agg [--every <duration>] [--workers <n>] [--timeout <duration>]";

    if workers == 0 {
        return Err(CommandError::Usage(format!("{USAGE} (--workers must be at least 1)")));
    }
    if timeout.is_zero() {
        return Err(CommandError::Usage(format!("{USAGE} (--timeout must be positive)")));
    }

    let Some(every) = every else {
        let outcome = scrape_once(&state.db, &state.client, timeout).await?;
        print_outcome(out, &outcome)?;
        return Ok(());
    };
    if every.is_zero() {
        return Err(CommandError::Usage(format!("{USAGE} (--every must be positive)")));
    }

    writeln!(
        out,
        "Collecting feeds every {:?} with {} worker(s)",
        every, workers
    )?;
    out.flush()?;

    let settings = WorkerSettings {
        workers,
        every,
        fetch_timeout: timeout,
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_workers(
        state.db.clone(),
        state.client.clone(),
        settings,
        state.shutdown.clone(),
        move |worker, result| {
            let _ = tx.send((worker, result));
        },
    ));

    // Ends once every worker has stopped and dropped its sender
    while let Some((worker, result)) = rx.recv().await {
        match result {
            Ok(outcome) => print_outcome(out, &outcome)?,
            Err(e) => {
                tracing::warn!(worker = worker, error = %e, "Scrape cycle failed");
                writeln!(out, "Error: {}", e)?;
            }
        }
        out.flush()?;
    }

    if let Err(e) = handle.await {
        tracing::warn!(error = %e, "Scrape workers task failed");
    }
    Ok(())
}
