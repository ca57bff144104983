//! # Stream Session Integration Tests
//!
//! Drives the session state machine, its supervisor and the connection
//! manager end to end over a scripted dialer. Each test reads like a
//! scenario: what the stream sends, what the vote channel must see, and how
//! the session ends.

#![forbid(unsafe_code)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use lib_votes::core::decoder::DecodeError;
use lib_votes::{
    ConnectionManager, CredentialError, CredentialStore, IngestError, OptionsSource, SessionEnd, SessionState,
    StorageError,
};
use support::{config, drain, events_of, ingestor, ingestor_with, request, FakeDialer, Script};

struct BrokenStore;

impl OptionsSource for BrokenStore {
    async fn poll_options(&self) -> Result<Vec<Vec<String>>, StorageError> {
        Err(StorageError::ConnectionError("database is down".to_string()))
    }
}

async fn wait_for_streaming<S: OptionsSource>(ingestor: &support::Ingestor<S>) {
    let mut state = ingestor.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == SessionState::Streaming))
        .await
        .expect("session never reached Streaming")
        .unwrap();
}

#[tokio::test]
async fn test_cat_and_dog_vote_in_vocabulary_order() {
    let (ingestor, mut votes) = ingestor(
        &["cat", "dog"],
        vec![Script::Body(vec!["{\"text\":\"I love my Cat and dog\"}\r\n"])],
        8,
        0,
    );

    let outcome = ingestor.run_session().await;
    assert_eq!(drain(&mut votes), ["cat", "dog"]);
    assert_eq!(outcome.messages, 1);
    assert_eq!(outcome.votes, 2);
    assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Closed)));
    assert_eq!(ingestor.state(), SessionState::Terminated);
}

#[test]
fn test_missing_secret_is_reported_by_name() {
    let store = CredentialStore::with_lookup(|name| match name {
        "SP_TWITTER_ACCESSSECRET" => None,
        other => Some(format!("value-of-{}", other)),
    });

    let err = store.get().unwrap_err();
    assert!(matches!(err, CredentialError::MissingSecret("SP_TWITTER_ACCESSSECRET")));
    assert!(!store.is_loaded());
}

#[tokio::test]
async fn test_dial_while_held_closes_the_old_connection_first() {
    let dialer = FakeDialer::new(vec![Script::Held(vec![]), Script::Held(vec![])]);
    let events = dialer.events();
    let manager = ConnectionManager::new(dialer);

    let first = manager.dial(&request()).await.unwrap();
    let second = manager.dial(&request()).await.unwrap();

    assert_eq!(events_of(&events), ["open#1", "close#1", "open#2"]);
    assert!(first.is_closed());
    assert_eq!(manager.current_id(), Some(second.id()));
}

#[tokio::test]
async fn test_good_record_then_garbage_ends_the_session() {
    let (ingestor, mut votes) = ingestor(
        &["cat"],
        vec![Script::Held(vec!["{\"text\":\"a cat\"}\r\n", "<html>Service Unavailable</html>"])],
        8,
        0,
    );

    let outcome = ingestor.run_session().await;
    assert_eq!(drain(&mut votes), ["cat"]);
    assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Malformed(_))));
    assert!(!ingestor.connections().is_connected());
}

#[tokio::test]
async fn test_close_mid_read_terminates_the_session() {
    let (ingestor, _votes) = ingestor(&["cat"], vec![Script::Held(vec!["\r\n"])], 8, 0);

    let session = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run_session().await }
    });
    wait_for_streaming(&ingestor).await;
    ingestor.connections().close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Cancelled)));
    assert_eq!(ingestor.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_votes_keep_message_order() {
    let (ingestor, mut votes) = ingestor(
        &["cat", "dog"],
        vec![Script::Body(vec![
            "{\"text\":\"dog\"}\r\n",
            "{\"text\":\"cat dog\"}\r\n{\"text\":\"just a cat\"}\r\n",
        ])],
        8,
        0,
    );

    ingestor.run_session().await;
    assert_eq!(drain(&mut votes), ["dog", "cat", "dog", "cat"]);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dialer = FakeDialer::new(vec![Script::Held(vec![])]);
    let events = dialer.events();
    let manager = ConnectionManager::new(dialer);

    manager.close().await;
    manager.dial(&request()).await.unwrap();
    manager.close().await;
    manager.close().await;

    assert_eq!(events_of(&events), ["open#1", "close#1"]);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_storage_failure_never_dials() {
    let (ingestor, _votes) = ingestor_with(BrokenStore, FakeDialer::new(vec![]), 8, config(0));

    let outcome = ingestor.run_session().await;
    assert!(matches!(outcome.end, SessionEnd::StorageFailed(_)));
    assert_eq!(ingestor.connections().dialer().dials(), 0);
}

#[tokio::test]
async fn test_slow_consumer_holds_the_stream_back() {
    let (ingestor, mut votes) = ingestor(
        &["cat"],
        vec![Script::Body(vec![
            "{\"text\":\"cat 1\"}\r\n{\"text\":\"cat 2\"}\r\n{\"text\":\"cat 3\"}\r\n",
        ])],
        1,
        0,
    );

    let session = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run_session().await }
    });

    // One vote fits the channel, the session waits on the second.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!session.is_finished());
    assert_eq!(ingestor.state(), SessionState::Streaming);

    let mut received = Vec::new();
    while let Some(vote) = votes.recv().await {
        received.push(vote.option);
        if received.len() == 3 {
            break;
        }
    }
    let outcome = session.await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(outcome.votes, 3);
}

#[tokio::test]
async fn test_supervisor_reconnects_until_attempts_run_out() {
    let (ingestor, mut votes) = ingestor(
        &["cat", "dog"],
        vec![
            Script::Body(vec!["{\"text\":\"cat\"}\r\n"]),
            Script::Body(vec!["{\"text\":\"dog\"}\r\n"]),
            Script::Status(503),
        ],
        8,
        1,
    );

    let err = ingestor.run().await.unwrap_err();
    assert!(matches!(err, IngestError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(drain(&mut votes), ["cat", "dog"]);
    assert_eq!(ingestor.connections().dialer().dials(), 3);
}

#[tokio::test]
async fn test_rejected_credentials_stop_the_supervisor() {
    let (ingestor, _votes) = ingestor(&["cat"], vec![Script::Status(401), Script::Body(vec![])], 8, 5);

    let err = ingestor.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Unauthorized(_)));
    assert_eq!(ingestor.connections().dialer().dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_at_least_a_minute() {
    let (ingestor, mut votes) = ingestor(
        &["cat"],
        vec![Script::Status(420), Script::Body(vec!["{\"text\":\"cat\"}\r\n"])],
        8,
        1,
    );

    let started = tokio::time::Instant::now();
    let _ = ingestor.run().await;
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(drain(&mut votes), ["cat"]);
}

#[tokio::test]
async fn test_shutdown_stops_a_streaming_supervisor() {
    let (ingestor, _votes) = ingestor(&["cat"], vec![Script::Held(vec![])], 8, 5);

    let worker = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run().await }
    });
    wait_for_streaming(&ingestor).await;
    ingestor.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(!ingestor.connections().is_connected());
    assert_eq!(ingestor.connections().dialer().dials(), 1);
}

#[tokio::test]
async fn test_local_close_stops_the_supervisor_without_redialing() {
    let (ingestor, _votes) = ingestor(&["cat"], vec![Script::Held(vec![]), Script::Held(vec![])], 8, 5);

    let worker = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run().await }
    });
    wait_for_streaming(&ingestor).await;
    ingestor.connections().close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(ingestor.connections().dialer().dials(), 1);
}

#[tokio::test]
async fn test_shutdown_frees_a_producer_blocked_on_a_full_channel() {
    let (ingestor, _votes) = ingestor(
        &["cat"],
        vec![Script::Held(vec!["{\"text\":\"cat\"}\r\n{\"text\":\"cat\"}\r\n{\"text\":\"cat\"}\r\n"])],
        1,
        5,
    );

    let worker = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    ingestor.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_dropped_consumer_ends_the_supervisor() {
    let (ingestor, votes) = ingestor(&["cat"], vec![Script::Held(vec!["{\"text\":\"cat\"}\r\n"])], 8, 5);
    drop(votes);

    let outcome = ingestor.run_session().await;
    assert!(matches!(outcome.end, SessionEnd::ConsumerGone));
    assert!(!ingestor.connections().is_connected());
}
