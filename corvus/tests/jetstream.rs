//! JetStream scenarios against the mock server's API surface.

mod common;

use std::time::Duration;

use anyhow::Result;
use corvus::jetstream::{
    AckPolicy, ConsumerConfig, DeliverPolicy, JetStreamError, RetentionPolicy, StorageType,
    StreamConfig,
};
use corvus::{Client, ClientOptions};
use tracing_test::traced_test;

use crate::common::MockServer;

async fn connect(server: &MockServer) -> Result<Client> {
    Ok(Client::connect(ClientOptions::default().with_server(&server.url())?).await?)
}

#[tokio::test]
#[traced_test]
async fn stream_publish_acks_increasing_sequences() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    let info = js
        .create_stream(
            &StreamConfig::new("S")
                .subjects(["S.>"])
                .retention(RetentionPolicy::Limits)
                .storage(StorageType::File),
        )
        .await?;
    assert_eq!(info.config.name, "S");
    assert_eq!(info.state.messages, 0);

    for (n, expected_seq) in [(1u8, 1u64), (2, 2), (3, 3)] {
        let ack = js.publish("S.orders", vec![n]).await?;
        assert_eq!(ack.stream, "S");
        assert_eq!(ack.seq, expected_seq);
        assert!(!ack.is_duplicate());
    }

    let info = js.stream_info("S").await?;
    assert_eq!(info.state.messages, 3);
    assert_eq!(info.state.last_seq, 3);
    assert_eq!(server.stream_len("S"), 3);

    client.close().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn pull_fetch_then_ack_empties_the_consumer() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("S").subjects(["S.>"]))
        .await?;
    for n in 1u8..=3 {
        js.publish("S.jobs", vec![n]).await?;
    }

    let consumer = js
        .create_consumer(
            "S",
            ConsumerConfig::durable("c1")
                .deliver_policy(DeliverPolicy::All)
                .ack_policy(AckPolicy::Explicit),
        )
        .await?;
    assert_eq!(consumer.name(), "c1");
    assert_eq!(consumer.stream(), "S");

    let batch = consumer.fetch(10, Duration::from_secs(2)).await?;
    assert_eq!(batch.len(), 3);
    for (index, message) in batch.iter().enumerate() {
        let meta = message.metadata();
        assert_eq!(meta.stream, "S");
        assert_eq!(meta.consumer, "c1");
        assert_eq!(meta.stream_sequence, index as u64 + 1);
        message.ack().await?;
    }
    client.flush().await?;

    let again = consumer.fetch(10, Duration::from_millis(500)).await?;
    assert!(again.is_empty(), "everything was acked");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn stream_info_for_missing_stream() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    let outcome = js.stream_info("NOPE").await;
    assert!(matches!(
        outcome,
        Err(JetStreamError::StreamNotFound { name }) if name == "NOPE"
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn consumer_info_for_missing_consumer() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("S").subjects(["S.>"]))
        .await?;
    let outcome = js.consumer_info("S", "ghost").await;
    assert!(matches!(
        outcome,
        Err(JetStreamError::ConsumerNotFound { stream, consumer })
            if stream == "S" && consumer == "ghost"
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn purge_empties_a_stream() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("P").subjects(["P.>"]))
        .await?;
    for _ in 0..4 {
        js.publish("P.x", "data").await?;
    }
    let purged = js.purge_stream("P").await?;
    assert_eq!(purged, 4);
    assert_eq!(js.stream_info("P").await?.state.messages, 0);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn get_message_by_sequence_and_subject() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("G").subjects(["G.>"]))
        .await?;
    js.publish("G.alpha", "first").await?;
    js.publish("G.beta", "second").await?;
    js.publish("G.alpha", "third").await?;

    let by_seq = js.get_message("G", 2).await?;
    assert_eq!(by_seq.subject, "G.beta");
    assert_eq!(by_seq.sequence, 2);
    assert_eq!(&by_seq.payload[..], b"second");

    let last_alpha = js.get_last_message("G", "G.alpha").await?;
    assert_eq!(last_alpha.sequence, 3);
    assert_eq!(&last_alpha.payload[..], b"third");

    assert!(matches!(
        js.get_message("G", 99).await,
        Err(JetStreamError::MessageNotFound)
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn delete_message_leaves_gap_in_sequences() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("D").subjects(["D.>"]))
        .await?;
    for n in 1u8..=3 {
        js.publish("D.x", vec![n]).await?;
    }

    assert!(js.delete_message("D", 2).await?);
    let info = js.stream_info("D").await?;
    assert_eq!(info.state.messages, 2);
    // sequences are not renumbered
    assert_eq!(info.state.last_seq, 3);

    assert!(matches!(
        js.delete_message("D", 2).await,
        Err(JetStreamError::MessageNotFound)
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn delete_stream_reports_success() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    js.create_stream(&StreamConfig::new("GONE").subjects(["GONE.>"]))
        .await?;
    assert!(js.delete_stream("GONE").await?);
    assert!(matches!(
        js.stream_info("GONE").await,
        Err(JetStreamError::StreamNotFound { .. })
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn account_info_answers() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    let account = js.account_info().await?;
    assert_eq!(account.limits.max_streams, -1);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn not_enabled_without_jetstream() -> Result<()> {
    // plain mock: no $JS.API responders → 503 → NotEnabled
    let server = MockServer::start().await;
    let client = connect(&server).await?;
    let js = client.jetstream().with_timeout(Duration::from_secs(1));

    let outcome = js.stream_info("S").await;
    assert!(matches!(outcome, Err(JetStreamError::NotEnabled)), "{outcome:?}");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_names_fail_before_any_io() -> Result<()> {
    let server = MockServer::start_with_jetstream().await;
    let client = connect(&server).await?;
    let js = client.jetstream();

    assert!(matches!(
        js.stream_info("").await,
        Err(JetStreamError::StreamNameRequired)
    ));
    assert!(matches!(
        js.stream_info("has.dots").await,
        Err(JetStreamError::InvalidStreamName { .. })
    ));
    assert!(matches!(
        js.consumer_info("S", "bad name").await,
        Err(JetStreamError::InvalidConsumerName { .. })
    ));

    client.close().await?;
    Ok(())
}
