//! Integration tests for the scrape cycle: oldest-first selection, the claim
//! before fetch, resilience to failing feeds and concurrent workers.
//!
//! HTTP is served by wiremock; each test owns its database.

use gator::feed::{
    build_http_client, scrape_once, FetchStage, ScrapeOutcome, DEFAULT_FETCH_TIMEOUT,
};
use gator::storage::{now_millis, Database, Feed};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VALID_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
    <title>Mock</title>
    <item><title>Hello</title><link>https://example.com/hello</link></item>
</channel></rss>"#;

async fn db_with_feeds(db: &Database, urls: &[String]) -> Vec<Feed> {
    let user = db.create_user("scraper").await.unwrap();
    let mut feeds = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        feeds.push(db.create_feed(&format!("feed {i}"), url, user.id).await.unwrap());
    }
    feeds
}

fn claimed_feed(outcome: &ScrapeOutcome) -> Option<i64> {
    match outcome {
        ScrapeOutcome::Idle => None,
        ScrapeOutcome::Fetched { feed, .. } | ScrapeOutcome::Failed { feed, .. } => Some(feed.id),
    }
}

// ============================================================================
// Selection Order
// ============================================================================

#[tokio::test]
async fn test_never_fetched_then_oldest_first() {
    let db = Database::open(":memory:").await.unwrap();
    let urls: Vec<String> = (1..=3)
        .map(|i| format!("https://f{i}.example.com/rss"))
        .collect();
    let feeds = db_with_feeds(&db, &urls).await;
    let (f1, f2, f3) = (&feeds[0], &feeds[1], &feeds[2]);

    let now = now_millis();
    db.mark_feed_fetched(f2.id, now - 10_000).await.unwrap();
    db.mark_feed_fetched(f3.id, now - 5_000).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let next = db.next_feed_to_fetch().await.unwrap();
        order.push(next.id);
        db.mark_feed_fetched(next.id, now_millis()).await.unwrap();
    }
    assert_eq!(order, vec![f1.id, f2.id, f3.id]);
}

#[tokio::test]
async fn test_claim_rotation_is_round_robin() {
    let db = Database::open(":memory:").await.unwrap();
    let urls: Vec<String> = (1..=3)
        .map(|i| format!("https://f{i}.example.com/rss"))
        .collect();
    let feeds = db_with_feeds(&db, &urls).await;

    // Every claim lands in the same millisecond
    let at = now_millis();
    let mut order = Vec::new();
    for _ in 0..6 {
        order.push(db.claim_next_feed(at).await.unwrap().unwrap().id);
    }

    let ids: Vec<i64> = feeds.iter().map(|f| f.id).collect();
    let expected: Vec<i64> = ids.iter().chain(ids.iter()).copied().collect();
    assert_eq!(order, expected);
}

// ============================================================================
// Resilience
// ============================================================================

#[tokio::test]
async fn test_failing_feed_waits_for_its_turn() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let urls = vec![
        format!("{}/broken", mock_server.uri()),
        format!("{}/a", mock_server.uri()),
        format!("{}/b", mock_server.uri()),
    ];
    let feeds = db_with_feeds(&db, &urls).await;
    let client = build_http_client().unwrap();

    let first = scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap();
    match &first {
        ScrapeOutcome::Failed { feed, .. } => assert_eq!(feed.id, feeds[0].id),
        other => panic!("Expected Failed, got {:?}", other),
    }

    // The claim stands even though the fetch failed
    let broken = db.get_feed(feeds[0].id).await.unwrap();
    assert!(broken.last_fetched_at.is_some());

    let mut next = Vec::new();
    for _ in 0..2 {
        let outcome = scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap();
        assert!(matches!(outcome, ScrapeOutcome::Fetched { .. }), "got {:?}", outcome);
        next.push(claimed_feed(&outcome).unwrap());
    }
    assert_eq!(next, vec![feeds[1].id, feeds[2].id]);

    // Only now does the broken feed come around again
    let again = scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap();
    assert_eq!(claimed_feed(&again), Some(feeds[0].id));
}

#[tokio::test]
async fn test_unreachable_feed_fails_at_request_stage() {
    // Bind and release a port so nothing is listening on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let db = Database::open(":memory:").await.unwrap();
    let feeds = db_with_feeds(&db, &[format!("http://127.0.0.1:{port}/rss")]).await;
    let client = build_http_client().unwrap();

    let before = now_millis();
    match scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap() {
        ScrapeOutcome::Failed { feed, error } => {
            assert_eq!(feed.id, feeds[0].id);
            assert_eq!(error.stage(), FetchStage::Request);
        }
        other => panic!("Expected Failed, got {:?}", other),
    }

    let stamped = db.get_feed(feeds[0].id).await.unwrap();
    assert!(stamped.last_fetched_at.unwrap() >= before);
}

#[tokio::test]
async fn test_deleted_feed_is_skipped() {
    let db = Database::open(":memory:").await.unwrap();
    let urls = vec!["https://gone.example.com/rss".to_string()];
    let feeds = db_with_feeds(&db, &urls).await;

    let next = db.next_feed_to_fetch().await.unwrap();
    db.delete_feed(feeds[0].id).await.unwrap();

    // The two-step path reports the vanished feed as NotFound
    let err = db.mark_feed_fetched(next.id, now_millis()).await.unwrap_err();
    assert!(err.is_not_found());

    let client = build_http_client().unwrap();
    let outcome = scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap();
    assert!(matches!(outcome, ScrapeOutcome::Idle));
}

// ============================================================================
// Concurrent Workers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gator.db");
    let db = Database::open(db_path.to_str().unwrap()).await.unwrap();

    let urls: Vec<String> = (0..8)
        .map(|i| format!("https://f{i}.example.com/rss"))
        .collect();
    let feeds = db_with_feeds(&db, &urls).await;

    let at = now_millis();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.claim_next_feed(at).await })
        })
        .collect();

    let mut claimed = HashSet::new();
    for handle in handles {
        let feed = handle.await.unwrap().unwrap().unwrap();
        assert!(claimed.insert(feed.id), "feed {} claimed twice", feed.id);
    }

    let all: HashSet<i64> = feeds.iter().map(|f| f.id).collect();
    assert_eq!(claimed, all);
}

#[tokio::test]
async fn test_fetched_items_reach_caller() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
        .expect(1)
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let feeds = db_with_feeds(&db, &[format!("{}/rss", mock_server.uri())]).await;
    let client = build_http_client().unwrap();

    match scrape_once(&db, &client, DEFAULT_FETCH_TIMEOUT).await.unwrap() {
        ScrapeOutcome::Fetched { feed, items } => {
            assert_eq!(feed.id, feeds[0].id);
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].title, "Hello");
            assert_eq!(items[0].link, "https://example.com/hello");
        }
        other => panic!("Expected Fetched, got {:?}", other),
    }
}
