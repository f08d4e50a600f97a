//! The `idmap` worker maps external accounts to stable numeric ids.

mod common;

use channel_system::*;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;

async fn call(client: &WorkerHandle, verb: &str, provider: &str, external: &str) -> Result<Value, ChannelError> {
    client
        .request(
            &id("idmap.0"),
            verb,
            json!({ "provider": provider, "id": external }),
        )
        .await
        .map(|reply| reply["id"].clone())
}

#[tokio::test]
async fn test_ids_are_stable_and_unique() {
    let cluster = Cluster::new();
    let host = cluster.host("h1", |_| {}).await;
    host.spawn_worker(id("idmap.0")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    assert_eq!(call(&client, "get_id", "steam", "7").await.unwrap(), Value::Null);

    let (a, b) = tokio::join!(
        call(&client, "get_create_id", "steam", "7"),
        call(&client, "get_create_id", "steam", "7"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert!(a.as_u64().is_some_and(|id| id > 0));

    let other = call(&client, "get_create_id", "google", "7").await.unwrap();
    assert_ne!(other, a);
    assert_eq!(call(&client, "get_id", "steam", "7").await.unwrap(), a);
}

#[tokio::test]
async fn test_mapping_outlives_the_worker() {
    let cluster = Cluster::new();
    let host = cluster.host("h1", |_| {}).await;
    let mapper = host.spawn_worker(id("idmap.0")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    let first = call(&client, "get_create_id", "apple", "x").await.unwrap();
    mapper.shutdown().await.unwrap();

    let second_host = cluster.host("h2", |_| {}).await;
    second_host.spawn_worker(id("idmap.0")).await.unwrap();
    assert_eq!(call(&client, "get_create_id", "apple", "x").await.unwrap(), first);
}

#[tokio::test]
async fn test_missing_fields_are_rejected() {
    let cluster = Cluster::new();
    let host = cluster.host("h1", |_| {}).await;
    host.spawn_worker(id("idmap.0")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    let err = call(&client, "get_create_id", "", "1").await.unwrap_err();
    assert!(matches!(err, ChannelError::Domain(_)));
    let err = client
        .request(&id("idmap.0"), "get_create_id", json!({ "provider": "steam" }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid get_create_id payload"));
}

#[tokio::test]
async fn test_mappers_on_one_host_share_the_allocator() {
    let cluster = Cluster::new();
    let host = cluster.host("h1", |_| {}).await;
    let first = host.spawn_worker(id("idmap.0")).await.unwrap();
    let second = host.spawn_worker(id("idmap.1")).await.unwrap();
    let client = host.spawn_worker(id("client.1")).await.unwrap();

    for mapper in [&first, &second] {
        let allocator = mapper
            .inspect(|ctx| ctx.ext::<Arc<IdAllocator>>().cloned())
            .await
            .unwrap()
            .expect("allocator installed");
        assert!(Arc::ptr_eq(&allocator, host.id_allocator()));
    }

    let ask = |mapper: &'static str| {
        let client = client.clone();
        async move {
            client
                .request(
                    &id(mapper),
                    "get_create_id",
                    json!({ "provider": "steam", "id": "42" }),
                )
                .await
                .map(|reply| reply["id"].clone())
        }
    };
    let (a, b) = tokio::join!(ask("idmap.0"), ask("idmap.1"));
    assert_eq!(a.unwrap(), b.unwrap());
}
