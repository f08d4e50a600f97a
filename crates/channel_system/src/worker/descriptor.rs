//! # Worker Type Descriptors
//!
//! A worker type is assembled once, before any instance exists, from a
//! [`WorkerTypeBuilder`]: behaviour flags, the message handler table, admin
//! commands, lifecycle hooks and the typed per-instance state the handlers
//! use. Mixins such as chat are plain functions that take a builder and add
//! their handlers to it.
//!
//! Registering the same verb, command, hook or extension type twice is a
//! configuration error reported by [`WorkerTypeBuilder::build`]; nothing is
//! silently overwritten.

use crate::error::ChannelError;
use crate::ids::ChannelId;
use crate::tree::{split_path, DataKey};
use crate::worker::context::{Incoming, Reply, WorkerContext};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Message handler for requests and pushes.
pub type Handler =
    Arc<dyn Fn(&mut WorkerContext, &Incoming) -> Result<Reply, ChannelError> + Send + Sync>;

/// Admin command; receives the whitespace-split arguments after the name.
pub type CommandHandler =
    Arc<dyn Fn(&mut WorkerContext, &[&str]) -> Result<String, ChannelError> + Send + Sync>;

pub type InitHook = Arc<dyn Fn(&mut WorkerContext) -> Result<(), ChannelError> + Send + Sync>;

pub type TickHook = Arc<dyn Fn(&mut WorkerContext) + Send + Sync>;

/// Subscription veto: an error is returned to the would-be subscriber.
pub type SubscribeHook =
    Arc<dyn Fn(&mut WorkerContext, &ChannelId, &[String]) -> Result<(), ChannelError> + Send + Sync>;

pub(crate) type ExtensionInit = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Verbs the runtime answers itself.
pub const BUILTIN_VERBS: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "set_channel_data",
    "apply_channel_data",
    "batch_set",
    "cmd",
];

pub(crate) struct ExtensionSlot {
    pub(crate) type_id: TypeId,
    pub(crate) init: ExtensionInit,
}

/// Collects the configuration of one worker type.
pub struct WorkerTypeBuilder {
    name: String,
    auto_destroy: bool,
    persist: bool,
    writable: Vec<Vec<String>>,
    unpersisted_public: Vec<String>,
    handlers: HashMap<String, Handler>,
    commands: HashMap<String, CommandHandler>,
    on_init: Option<InitHook>,
    on_tick: Option<TickHook>,
    on_subscribe: Option<SubscribeHook>,
    extensions: Vec<ExtensionSlot>,
    error: Option<ChannelError>,
}

impl WorkerTypeBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = Self {
            name: name.to_string(),
            auto_destroy: false,
            persist: false,
            writable: Vec::new(),
            unpersisted_public: Vec::new(),
            handlers: HashMap::new(),
            commands: HashMap::new(),
            on_init: None,
            on_tick: None,
            on_subscribe: None,
            extensions: Vec::new(),
            error: None,
        };
        if name.is_empty() || name.contains('.') {
            builder.fail(format!("invalid worker type name {name:?}"));
        }
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(ChannelError::Config(format!("{}: {message}", self.name)));
        }
    }

    /// Opts instances into idle auto-destroy.
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Loads instances from and commits them to the datastore.
    pub fn persist(mut self, enabled: bool) -> Self {
        self.persist = enabled;
        self
    }

    /// Allows remote `set_channel_data` below a public prefix.
    pub fn writable(mut self, prefix: &str) -> Self {
        let relative = prefix.strip_prefix("public.").unwrap_or(prefix);
        let path = split_path(relative);
        if path.is_empty() {
            self.fail(format!("empty writable prefix {prefix:?}"));
        } else {
            self.writable.push(path);
        }
        self
    }

    /// Excludes a top-level public key from persistence (e.g. a client roster).
    pub fn unpersisted(mut self, public_key: &str) -> Self {
        self.unpersisted_public.push(public_key.to_string());
        self
    }

    /// Registers the handler of `verb`.
    pub fn handler<F>(mut self, verb: &str, handler: F) -> Self
    where
        F: Fn(&mut WorkerContext, &Incoming) -> Result<Reply, ChannelError> + Send + Sync + 'static,
    {
        if BUILTIN_VERBS.contains(&verb) {
            self.fail(format!("verb {verb} is reserved by the runtime"));
        } else if self.handlers.contains_key(verb) {
            self.fail(format!("handler for {verb} registered twice"));
        } else {
            self.handlers.insert(verb.to_string(), Arc::new(handler));
        }
        self
    }

    /// Registers an admin command reachable through the `cmd` request.
    pub fn command<F>(mut self, name: &str, command: F) -> Self
    where
        F: Fn(&mut WorkerContext, &[&str]) -> Result<String, ChannelError> + Send + Sync + 'static,
    {
        if self.commands.contains_key(name) {
            self.fail(format!("command {name} registered twice"));
        } else {
            self.commands.insert(name.to_string(), Arc::new(command));
        }
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkerContext) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        if self.on_init.is_some() {
            self.fail("on_init registered twice".to_string());
        } else {
            self.on_init = Some(Arc::new(hook));
        }
        self
    }

    pub fn on_tick<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkerContext) + Send + Sync + 'static,
    {
        if self.on_tick.is_some() {
            self.fail("on_tick registered twice".to_string());
        } else {
            self.on_tick = Some(Arc::new(hook));
        }
        self
    }

    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkerContext, &ChannelId, &[String]) -> Result<(), ChannelError>
            + Send
            + Sync
            + 'static,
    {
        if self.on_subscribe.is_some() {
            self.fail("on_subscribe registered twice".to_string());
        } else {
            self.on_subscribe = Some(Arc::new(hook));
        }
        self
    }

    /// Gives every instance a `T::default()` in its context extensions.
    pub fn extension<T: Any + Send + Default>(self) -> Self {
        self.extension_with(T::default)
    }

    /// Gives every instance a fresh `T` built by `init`.
    pub fn extension_with<T, F>(mut self, init: F) -> Self
    where
        T: Any + Send,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        if self.extensions.iter().any(|e| e.type_id == type_id) {
            self.fail(format!("extension {} registered twice", type_name::<T>()));
        } else {
            self.extensions.push(ExtensionSlot {
                type_id,
                init: Arc::new(move || Box::new(init()) as Box<dyn Any + Send>),
            });
        }
        self
    }

    /// Finalizes the type, or reports the first configuration error.
    pub fn build(self) -> Result<WorkerType, ChannelError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(WorkerType {
            name: self.name,
            auto_destroy: self.auto_destroy,
            persist: self.persist,
            writable: self.writable,
            unpersisted_public: self.unpersisted_public,
            handlers: self.handlers,
            commands: self.commands,
            on_init: self.on_init,
            on_tick: self.on_tick,
            on_subscribe: self.on_subscribe,
            extensions: self.extensions,
        })
    }
}

/// Immutable description of a worker type.
pub struct WorkerType {
    name: String,
    auto_destroy: bool,
    persist: bool,
    writable: Vec<Vec<String>>,
    unpersisted_public: Vec<String>,
    handlers: HashMap<String, Handler>,
    commands: HashMap<String, CommandHandler>,
    pub(crate) on_init: Option<InitHook>,
    pub(crate) on_tick: Option<TickHook>,
    pub(crate) on_subscribe: Option<SubscribeHook>,
    pub(crate) extensions: Vec<ExtensionSlot>,
}

impl fmt::Debug for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut verbs: Vec<&String> = self.handlers.keys().collect();
        verbs.sort();
        f.debug_struct("WorkerType")
            .field("name", &self.name)
            .field("auto_destroy", &self.auto_destroy)
            .field("persist", &self.persist)
            .field("verbs", &verbs)
            .finish()
    }
}

impl WorkerType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auto_destroy(&self) -> bool {
        self.auto_destroy
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn unpersisted_public(&self) -> &[String] {
        &self.unpersisted_public
    }

    /// Whether a remote `set_channel_data` may touch `key`.
    pub fn is_writable(&self, key: &DataKey) -> bool {
        key.is_public() && self.writable.iter().any(|p| key.path().starts_with(p))
    }

    pub fn handler(&self, verb: &str) -> Option<&Handler> {
        self.handlers.get(verb)
    }

    pub fn command(&self, name: &str) -> Option<&CommandHandler> {
        self.commands.get(name)
    }

    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Worker types known to a host, by name.
#[derive(Debug, Default, Clone)]
pub struct WorkerRegistry {
    types: HashMap<String, Arc<WorkerType>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_type: WorkerType) -> Result<(), ChannelError> {
        if self.types.contains_key(worker_type.name()) {
            return Err(ChannelError::Config(format!(
                "worker type {} registered twice",
                worker_type.name()
            )));
        }
        self.types
            .insert(worker_type.name().to_string(), Arc::new(worker_type));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerType>> {
        self.types.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn noop(_: &mut WorkerContext, _: &Incoming) -> Result<Reply, ChannelError> {
        Ok(Reply::Value(Value::Null))
    }

    #[derive(Default)]
    struct Counter(u32);

    #[test]
    fn test_duplicate_handler_is_config_error() {
        let result = WorkerTypeBuilder::new("room")
            .handler("join", noop)
            .handler("join", noop)
            .build();
        assert!(matches!(result, Err(ChannelError::Config(msg)) if msg.contains("join")));
    }

    #[test]
    fn test_builtin_verbs_are_reserved() {
        let result = WorkerTypeBuilder::new("room").handler("subscribe", noop).build();
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    #[test]
    fn test_duplicate_extension_and_hooks() {
        assert!(WorkerTypeBuilder::new("room")
            .extension::<Counter>()
            .extension::<Counter>()
            .build()
            .is_err());
        assert!(WorkerTypeBuilder::new("room")
            .on_tick(|_| {})
            .on_tick(|_| {})
            .build()
            .is_err());
        assert!(WorkerTypeBuilder::new("bad.name").build().is_err());
    }

    #[test]
    fn test_writable_prefixes() {
        let worker_type = WorkerTypeBuilder::new("room")
            .writable("public.settings")
            .build()
            .unwrap();
        assert!(worker_type.is_writable(&DataKey::parse("public.settings.color").unwrap()));
        assert!(!worker_type.is_writable(&DataKey::parse("public.score").unwrap()));
        assert!(!worker_type.is_writable(&DataKey::parse("private.settings").unwrap()));
    }

    #[test]
    fn test_registry_refuses_duplicate_types() {
        let mut registry = WorkerRegistry::new();
        registry
            .register(WorkerTypeBuilder::new("room").build().unwrap())
            .unwrap();
        assert!(registry
            .register(WorkerTypeBuilder::new("room").build().unwrap())
            .is_err());
        assert_eq!(registry.names(), vec!["room"]);
    }
}
