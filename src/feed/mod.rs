//! Feed fetching, parsing and scrape scheduling.
//!
//! - [`parser`] - Event-driven RSS parsing with `quick-xml`
//! - [`fetcher`] - HTTP retrieval with a size cap and a per-call timeout
//! - [`scheduler`] - Oldest-first claim, fetch, and the worker loops around it

mod fetcher;
mod parser;
mod scheduler;

pub use fetcher::{build_http_client, fetch_feed, FetchError, FetchStage, DEFAULT_FETCH_TIMEOUT, USER_AGENT};
pub use parser::{parse_feed, ParseError, RssFeed, RssItem};
pub use scheduler::{run_workers, scrape_once, ScrapeOutcome, WorkerSettings};
