//! Chat on a room: gates, history and the broadcast to subscribers.

mod common;

use channel_system::*;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn room_type(settings: ChatSettings) -> WorkerType {
    chattable(
        WorkerTypeBuilder::new("room").persist(true),
        settings,
        Arc::new(DefaultChatPolicy),
    )
    .build()
    .unwrap()
}

fn listener_type() -> WorkerType {
    WorkerTypeBuilder::new("listener")
        .handler("listen", |ctx, _incoming| {
            ctx.subscribe_to(&"room.1".parse()?, &["*"]);
            Ok(Reply::ok())
        })
        .handler(workers::chat::CHAT_MSG_VERB, |ctx, incoming| {
            ctx.append("private.heard", vec![incoming.payload["text"].clone()])?;
            Ok(Reply::ok())
        })
        .build()
        .unwrap()
}

fn settings() -> ChatSettings {
    ChatSettings {
        history_size: 3,
        max_length: 20,
        cooldown_ms: 60_000,
        min_account_age_secs: 10,
    }
}

async fn say(client: &WorkerHandle, user: &str, text: &str) -> Result<Value, ChannelError> {
    client
        .request(
            &id("room.1"),
            "chat_send",
            json!({ "user": user, "text": text, "account_age_secs": 3600 }),
        )
        .await
}

async fn texts(client: &WorkerHandle, query: Value) -> Vec<String> {
    let reply = client.request(&id("room.1"), "chat_get", query).await.unwrap();
    reply["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_chat_reaches_subscribers_and_history() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| {
            r.register(room_type(settings())).unwrap();
            r.register(listener_type()).unwrap();
        })
        .await;
    host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();
    let listener = host.spawn_worker(id("listener.1")).await.unwrap();

    listener.notify_self("listen", Value::Null).unwrap();
    eventually("the subscription", || {
        let listener = listener.clone();
        async move {
            listener
                .inspect(|ctx| ctx.replica(&"room.1".parse().unwrap()).is_some())
                .await
                .unwrap()
        }
    })
    .await;

    let first = say(&client, "ann", "  hello  ").await.unwrap();
    assert_eq!(first["seq"], json!(1));
    assert_eq!(first["text"], json!("hello"));
    for (user, text) in [("bob", "two"), ("cat", "three"), ("dan", "four")] {
        say(&client, user, text).await.unwrap();
    }

    // ring keeps the last three
    assert_eq!(texts(&client, Value::Null).await, ["two", "three", "four"]);
    assert_eq!(texts(&client, json!({ "since": 3 })).await, ["four"]);
    assert_eq!(texts(&client, json!({ "limit": 1 })).await, ["four"]);

    eventually("all four broadcasts", || {
        let listener = listener.clone();
        async move {
            listener
                .inspect(|ctx| ctx.get("private.heard").cloned())
                .await
                .unwrap()
                == Some(json!(["hello", "two", "three", "four"]))
        }
    })
    .await;
}

#[tokio::test]
async fn test_chat_gates() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| r.register(room_type(settings())).unwrap())
        .await;
    host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    say(&client, "ann", "hi").await.unwrap();
    let err = say(&client, "ann", "again").await.unwrap_err();
    assert!(err.is_quiet());
    // cooldown is per user
    say(&client, "bob", "hi").await.unwrap();

    let err = say(&client, "cat", "   ").await.unwrap_err();
    assert!(err.is_quiet());
    let err = say(&client, "cat", &"x".repeat(21)).await.unwrap_err();
    assert!(matches!(err, ChannelError::Domain(_)));

    let err = client
        .request(
            &id("room.1"),
            "chat_send",
            json!({ "user": "new", "text": "hi", "account_age_secs": 5 }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Domain(_)));

    assert_eq!(texts(&client, Value::Null).await, ["hi", "hi"]);
}

#[tokio::test]
async fn test_history_persists_and_clears() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| r.register(room_type(settings())).unwrap())
        .await;
    let room = host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    say(&client, "ann", "kept").await.unwrap();
    room.shutdown().await.unwrap();
    host.spawn_worker(id("room.1")).await.unwrap();
    assert_eq!(texts(&client, Value::Null).await, ["kept"]);

    let reply = client
        .request(&id("room.1"), "cmd", json!({ "line": "chat_clear" }))
        .await
        .unwrap();
    assert_eq!(reply, json!("cleared 1 messages"));
    assert!(texts(&client, Value::Null).await.is_empty());

    // numbering continues after a clear, so paging clients see new messages
    let next = say(&client, "bob", "fresh").await.unwrap();
    assert_eq!(next["seq"], json!(2));
    assert_eq!(texts(&client, json!({ "since": 1 })).await, ["fresh"]);
}
