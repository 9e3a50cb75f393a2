//! gator: a multi-user command-line RSS aggregator.
//!
//! Users register, add and follow feeds, and `agg` scrapes the least recently
//! fetched feed, once or on an interval with several workers sharing the
//! SQLite store.

pub mod commands;
pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
