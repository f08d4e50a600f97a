//! # Id Mapper
//!
//! Maps external account ids (`provider`, `external id`) onto collision-free
//! numeric user ids.
//!
//! Two datastore records back every mapping:
//!
//! - `idmap/<provider>/<external>` holds the user id,
//! - `idmap/ids/<user id>` holds the owner, and doubles as the claim on
//!   that number.
//!
//! Every check-then-write runs under a [`ResourceLocks`] guard for the key it
//! checks, so a second caller always sees the first caller's committed
//! result. Nothing ever takes a lock wider than one key. The allocator lives
//! in the [`HostContext`](crate::host::HostContext), so every `idmap`
//! instance of a host shares its locks.

use crate::error::ChannelError;
use crate::persistence::Datastore;
use crate::resource_lock::ResourceLocks;
use crate::worker::{Incoming, Reply, WorkerContext, WorkerType, WorkerTypeBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker type name of the mapper.
pub const ID_MAPPER_TYPE: &str = "idmap";

/// User ids stay within the integer range JSON numbers carry exactly.
const MAX_ID: u64 = (1 << 53) - 1;
const MAX_ATTEMPTS: usize = 32;

type Generator = Box<dyn Fn() -> u64 + Send + Sync>;

fn random_id() -> u64 {
    (Uuid::new_v4().as_u128() as u64) & MAX_ID
}

pub struct IdAllocator {
    datastore: Arc<dyn Datastore>,
    locks: ResourceLocks<String>,
    generator: Generator,
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("locks", &self.locks.active())
            .finish()
    }
}

fn mapping_key(provider: &str, external: &str) -> String {
    format!("idmap/{provider}/{external}")
}

fn claim_key(id: u64) -> String {
    format!("idmap/ids/{id}")
}

fn as_id(value: &Value) -> Result<u64, ChannelError> {
    value
        .as_u64()
        .ok_or_else(|| ChannelError::Datastore(format!("id mapping holds {value}")))
}

impl IdAllocator {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self::with_generator(datastore, random_id)
    }

    /// Allocator drawing candidate ids from `generator`.
    pub fn with_generator<F>(datastore: Arc<dyn Datastore>, generator: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self {
            datastore,
            locks: ResourceLocks::new(),
            generator: Box::new(generator),
        }
    }

    /// Existing mapping, if any.
    pub async fn get_id(&self, provider: &str, external: &str) -> Result<Option<u64>, ChannelError> {
        match self.datastore.get(&mapping_key(provider, external)).await? {
            Some(value) => as_id(&value).map(Some),
            None => Ok(None),
        }
    }

    /// The user id of (`provider`, `external`), allocating one on first use.
    pub async fn get_create_id(&self, provider: &str, external: &str) -> Result<u64, ChannelError> {
        if provider.is_empty() || external.is_empty() {
            return Err(ChannelError::Domain("provider and id are required".to_string()));
        }
        let key = mapping_key(provider, external);
        let _guard = self.locks.acquire(key.clone()).await;
        if let Some(value) = self.datastore.get(&key).await? {
            return as_id(&value);
        }
        let id = self.claim(provider, external).await?;
        if let Err(e) = self.datastore.set(&key, json!(id)).await {
            // release the number so it is not lost to a mapping that never existed
            if let Err(release) = self.datastore.delete(&claim_key(id)).await {
                warn!(id, error = %release, "could not release user id claim");
            }
            return Err(e);
        }
        info!(provider, external, id, "allocated user id");
        Ok(id)
    }

    /// Claims an unused number for the given owner.
    async fn claim(&self, provider: &str, external: &str) -> Result<u64, ChannelError> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = (self.generator)() & MAX_ID;
            if candidate == 0 {
                continue;
            }
            let key = claim_key(candidate);
            let _guard = self.locks.acquire(key.clone()).await;
            if self.datastore.get(&key).await?.is_some() {
                debug!(candidate, "user id taken, drawing another");
                continue;
            }
            self.datastore
                .set(&key, json!({ "provider": provider, "id": external }))
                .await?;
            return Ok(candidate);
        }
        Err(ChannelError::Datastore(format!(
            "no free user id after {MAX_ATTEMPTS} attempts"
        )))
    }
}

#[derive(Debug, Deserialize)]
struct IdRequest {
    provider: String,
    id: String,
}

fn allocator(ctx: &WorkerContext) -> Result<Arc<IdAllocator>, ChannelError> {
    ctx.ext::<Arc<IdAllocator>>()
        .cloned()
        .ok_or_else(|| ChannelError::Config("id mapper not initialised".to_string()))
}

fn get_create_id(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: IdRequest = incoming.parse()?;
    let allocator = allocator(ctx)?;
    let token = ctx
        .defer()
        .ok_or_else(|| ChannelError::Domain("get_create_id must be a request".to_string()))?;
    let handle = ctx.handle().clone();
    tokio::spawn(async move {
        let result = allocator
            .get_create_id(&request.provider, &request.id)
            .await
            .map(|id| json!({ "id": id }));
        let _ = handle.complete(token, result);
    });
    Ok(Reply::Deferred)
}

fn get_id(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: IdRequest = incoming.parse()?;
    let allocator = allocator(ctx)?;
    let token = ctx
        .defer()
        .ok_or_else(|| ChannelError::Domain("get_id must be a request".to_string()))?;
    let handle = ctx.handle().clone();
    tokio::spawn(async move {
        let result = allocator
            .get_id(&request.provider, &request.id)
            .await
            .map(|id| json!({ "id": id }));
        let _ = handle.complete(token, result);
    });
    Ok(Reply::Deferred)
}

/// Builds the `idmap` worker type. Every instance on a host uses the host's
/// allocator.
pub fn worker_type() -> Result<WorkerType, ChannelError> {
    WorkerTypeBuilder::new(ID_MAPPER_TYPE)
        .on_init(|ctx| {
            let allocator = Arc::clone(ctx.host().id_allocator());
            ctx.extensions_mut().insert(allocator);
            Ok(())
        })
        .handler("get_create_id", get_create_id)
        .handler("get_id", get_id)
        .build()
}
