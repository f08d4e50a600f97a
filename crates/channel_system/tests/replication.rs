//! Subscribers converge on the source's public data, filtered or not.

mod common;

use channel_system::*;
use common::*;
use serde_json::{json, Value};

fn room_type() -> WorkerType {
    WorkerTypeBuilder::new("room")
        .writable("topic")
        .writable("score")
        .handler("bump", |ctx, incoming| {
            let n = incoming.payload["n"].as_u64().unwrap_or(0);
            for i in 0..n {
                ctx.batched_set(&format!("public.score.p{i}"), Some(json!(i * 10)))?;
            }
            ctx.append("public.log", vec![json!(n)])?;
            ctx.set("private.bumps", Some(json!(n)))?;
            Ok(Reply::ok())
        })
        .build()
        .unwrap()
}

fn viewer_type() -> WorkerType {
    WorkerTypeBuilder::new("viewer")
        .handler("watch", |ctx, incoming| {
            let source: ChannelId = incoming.payload["source"]
                .as_str()
                .unwrap_or_default()
                .parse()?;
            let fields: Vec<String> = serde_json::from_value(incoming.payload["fields"].clone())?;
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            ctx.subscribe_to(&source, &fields);
            Ok(Reply::ok())
        })
        .build()
        .unwrap()
}

async fn replica(viewer: &WorkerHandle, source: &str) -> Option<Value> {
    let source = id(source);
    viewer
        .inspect(move |ctx| ctx.replica(&source).map(|r| r.public().clone()))
        .await
        .unwrap()
}

async fn public(room: &WorkerHandle) -> Value {
    room.inspect(|ctx| ctx.data().public.clone()).await.unwrap()
}

async fn set(client: &WorkerHandle, key: &str, value: Value) -> Result<Value, ChannelError> {
    client
        .request(&id("room.1"), "set_channel_data", json!({ "key": key, "value": value }))
        .await
}

#[tokio::test]
async fn test_full_and_filtered_replicas_converge() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| {
            r.register(room_type()).unwrap();
            r.register(viewer_type()).unwrap();
        })
        .await;
    let room = host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();
    let all = host.spawn_worker(id("viewer.all")).await.unwrap();
    let scores = host.spawn_worker(id("viewer.scores")).await.unwrap();

    set(&client, "public.topic.name", json!("lobby")).await.unwrap();
    all.notify_self("watch", json!({ "source": "room.1", "fields": ["*"] }))
        .unwrap();
    scores
        .notify_self("watch", json!({ "source": "room.1", "fields": ["score"] }))
        .unwrap();
    eventually("both snapshots", || {
        let (all, scores) = (all.clone(), scores.clone());
        async move {
            replica(&all, "room.1").await.is_some() && replica(&scores, "room.1").await.is_some()
        }
    })
    .await;
    assert_eq!(replica(&all, "room.1").await, Some(json!({ "topic": { "name": "lobby" } })));
    assert_eq!(replica(&scores, "room.1").await, Some(json!({})));

    set(&client, "public.topic.name", json!("arena")).await.unwrap();
    set(&client, "public.topic.mode", json!({ "ranked": true })).await.unwrap();
    client.request(&id("room.1"), "bump", json!({ "n": 3 })).await.unwrap();
    set(&client, "public.score.p1", json!(99)).await.unwrap();
    set(&client, "public.topic.name", Value::Null).await.unwrap();
    set(&client, "public.score.p2", Value::Null).await.unwrap();

    let expected = json!({
        "topic": { "mode": { "ranked": true } },
        "score": { "p0": 0, "p1": 99 },
        "log": [3],
    });
    assert_eq!(public(&room).await, expected);

    eventually("replicas to converge", || {
        let (all, scores) = (all.clone(), scores.clone());
        let expected = expected.clone();
        async move {
            replica(&all, "room.1").await == Some(expected.clone())
                && replica(&scores, "room.1").await
                    == Some(json!({ "score": expected["score"].clone() }))
        }
    })
    .await;
}

#[tokio::test]
async fn test_remote_writes_limited_to_writable_prefixes() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| r.register(room_type()).unwrap())
        .await;
    let room = host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    let err = set(&client, "public.log", json!([1])).await.unwrap_err();
    assert!(matches!(err, ChannelError::FieldMismatch(_)));
    let err = set(&client, "private.bumps", json!(1)).await.unwrap_err();
    assert!(matches!(err, ChannelError::FieldMismatch(_)));

    let err = client
        .request(
            &id("room.1"),
            "set_channel_data",
            json!({ "key": "public.log", "value": 1, "quiet": true }),
        )
        .await
        .unwrap_err();
    assert!(err.is_quiet());
    assert_eq!(public(&room).await, json!({}));
}

#[tokio::test]
async fn test_double_subscribe_is_rejected() {
    let cluster = Cluster::new();
    let host = cluster
        .host("h1", |r| r.register(room_type()).unwrap())
        .await;
    host.spawn_worker(id("room.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    let reply = client
        .request(&id("room.1"), "subscribe", json!({ "fields": ["*"] }))
        .await
        .unwrap();
    assert_eq!(reply["public"], json!({}));
    assert_eq!(
        client
            .request(&id("room.1"), "subscribe", json!({ "fields": ["*"] }))
            .await,
        Err(ChannelError::AlreadySubscribed)
    );
    client.request(&id("room.1"), "unsubscribe", Value::Null).await.unwrap();
    assert_eq!(
        client.request(&id("room.1"), "unsubscribe", Value::Null).await,
        Err(ChannelError::NotSubscribed)
    );
}
