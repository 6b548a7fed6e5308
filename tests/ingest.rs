//! Event stream consumer tests

use std::sync::Arc;
use std::time::Duration;

use plural_proxy::Ingest;
use plural_proxy::cache::EntityKind;
use plural_proxy::config::QueueConfig;
use plural_proxy::db::{EventQueue, MessageRepo};
use plural_proxy::discord::Snowflake;
use serde_json::json;
use tokio::sync::watch;

mod common;
use common::{AUTHOR, CHANNEL, Call, Fixture, GUILD, fixture};

fn queue_config() -> QueueConfig {
    QueueConfig {
        block: Duration::from_millis(50),
        ..QueueConfig::default()
    }
}

fn message_create(id: u64, content: &str) -> String {
    json!({
        "t": "MESSAGE_CREATE",
        "d": {
            "id": id.to_string(),
            "channel_id": CHANNEL.to_string(),
            "guild_id": GUILD.to_string(),
            "type": 0,
            "content": content,
            "author": {"id": AUTHOR.to_string(), "username": "alice"}
        }
    })
    .to_string()
}

fn ingest(f: &Fixture) -> (EventQueue, Ingest) {
    let queue = EventQueue::new(f.pool.clone());
    let ingest = Ingest::new(queue.clone(), Arc::clone(&f.dispatcher), queue_config());
    ingest.init().unwrap();
    (queue, ingest)
}

fn pending(queue: &EventQueue) -> usize {
    let config = QueueConfig::default();
    queue.pending_count(&config.stream, &config.group).unwrap()
}

async fn deliver(queue: &EventQueue, ingest: &Ingest, payload: &str) -> bool {
    let config = QueueConfig::default();
    queue.publish(&config.stream, payload).unwrap();
    let entries = queue
        .read_new(&config.stream, &config.group, &config.consumer, 1)
        .unwrap();
    assert_eq!(entries.len(), 1);
    ingest.handle_entry(&entries[0]).await
}

#[tokio::test]
async fn message_create_is_proxied_and_acked() {
    let f = fixture();
    let (queue, ingest) = ingest(&f);

    assert!(deliver(&queue, &ingest, &message_create(10, "s;hello")).await);
    assert_eq!(pending(&queue), 0);

    assert!(
        MessageRepo::new(f.pool.clone())
            .find_by_original_id(Snowflake(10))
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn unknown_and_malformed_entries_are_acked() {
    let f = fixture();
    let (queue, ingest) = ingest(&f);

    assert!(deliver(&queue, &ingest, r#"{"t":"TYPING_START","d":{}}"#).await);
    assert!(deliver(&queue, &ingest, "not json").await);
    assert!(deliver(&queue, &ingest, r#"{"t":"MESSAGE_CREATE","d":{}}"#).await);

    assert_eq!(pending(&queue), 0);
    assert!(f.api.calls().is_empty());
}

#[tokio::test]
async fn bot_messages_are_ignored() {
    let f = fixture();
    let (queue, ingest) = ingest(&f);

    let payload = json!({
        "t": "MESSAGE_CREATE",
        "d": {
            "id": "10", "channel_id": CHANNEL.to_string(), "guild_id": GUILD.to_string(),
            "type": 0, "content": "s;hello",
            "author": {"id": "41", "username": "robot", "bot": true}
        }
    });
    assert!(deliver(&queue, &ingest, &payload.to_string()).await);
    assert!(f.api.calls().is_empty());
}

#[tokio::test]
async fn critical_failures_are_acked() {
    let f = fixture();
    f.api
        .fail_webhook_post
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let (queue, ingest) = ingest(&f);

    assert!(deliver(&queue, &ingest, &message_create(10, "s;hello")).await);
    assert_eq!(pending(&queue), 0);
}

#[tokio::test]
async fn webhooks_update_refreshes_cache() {
    let f = fixture();
    let (queue, ingest) = ingest(&f);

    let payload = json!({
        "t": "WEBHOOKS_UPDATE",
        "d": {"guild_id": GUILD.to_string(), "channel_id": CHANNEL.to_string()}
    });
    assert!(deliver(&queue, &ingest, &payload.to_string()).await);

    assert!(
        f.api
            .calls()
            .iter()
            .any(|call| matches!(call, Call::ListWebhooks(channel) if *channel == CHANNEL))
    );
    assert!(
        f.cache
            .get_raw(EntityKind::Webhooks, &CHANNEL.to_string())
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn consumer_runs_until_shutdown() {
    let f = fixture();
    let (queue, ingest) = ingest(&f);
    let (tx, rx) = watch::channel(false);

    let consumer = tokio::spawn({
        let ingest = ingest.clone();
        async move { ingest.run(rx).await }
    });

    queue
        .publish(&QueueConfig::default().stream, &message_create(10, "s;hello"))
        .unwrap();

    let messages = MessageRepo::new(f.pool.clone());
    let mut proxied = false;
    for _ in 0..100 {
        if messages.find_by_original_id(Snowflake(10)).unwrap().is_some() {
            proxied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(proxied);

    tx.send(true).unwrap();
    tokio_test::assert_ok!(consumer.await.unwrap());
    assert_eq!(pending(&queue), 0);
}
