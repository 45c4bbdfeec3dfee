//! Watch-driven read caches
//!
//! One [`Informer`] per watched kind applies the events of a watch stream to a
//! [`Store`] and notifies its [`ResourceEventHandler`]s. Readers only ever see
//! the `Store`, which is cheap to clone and safe to read from any worker.
//!
//! The informer understands the relist protocol of the kube watcher: objects
//! between `Init` and `InitDone` are buffered and swap in atomically, keys that
//! disappeared during the relist are reported as deletes. The first `InitDone`
//! marks the store as synced.

use crate::key::ObjectKey;
use futures::{Stream, StreamExt, TryStreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A change observed on the remote store
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object created or modified
    Apply(K),
    /// Object removed, with its last known state
    Delete(K),
    /// A full relist is starting
    Init,
    /// An object that is part of the relist
    InitApply(K),
    /// The relist is complete
    InitDone,
}

impl<K> From<watcher::Event<K>> for WatchEvent<K> {
    fn from(event: watcher::Event<K>) -> Self {
        match event {
            watcher::Event::Apply(obj) => WatchEvent::Apply(obj),
            watcher::Event::Delete(obj) => WatchEvent::Delete(obj),
            watcher::Event::Init => WatchEvent::Init,
            watcher::Event::InitApply(obj) => WatchEvent::InitApply(obj),
            watcher::Event::InitDone => WatchEvent::InitDone,
        }
    }
}

/// Receives the changes an [`Informer`] applies to its store
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &Arc<K>);
}

struct StoreInner<K> {
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: watch::Sender<bool>,
}

/// Read side of a per-kind cache
pub struct Store<K> {
    inner: Arc<StoreInner<K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                objects: RwLock::new(HashMap::new()),
                synced: watch::Sender::new(false),
            }),
        }
    }
}

impl<K> Store<K> {
    /// Look up an object by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_key(&ObjectKey::new(namespace, name))
    }

    pub fn get_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.objects.read().get(key).cloned()
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner.objects.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Wait until the initial listing has been applied
    pub async fn wait_until_synced(&self) {
        let mut rx = self.inner.synced.subscribe();
        // the sender lives as long as the store, so this cannot fail
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn insert(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.inner.objects.write().insert(key, obj)
    }

    fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.objects.write().remove(key)
    }

    fn replace(&self, objects: HashMap<ObjectKey, Arc<K>>) -> HashMap<ObjectKey, Arc<K>> {
        std::mem::replace(&mut *self.inner.objects.write(), objects)
    }

    fn mark_synced(&self) {
        self.inner.synced.send_replace(true);
    }
}

/// Applies watch events of one kind to a [`Store`] and fans them out
pub struct Informer<K> {
    kind: &'static str,
    store: Store<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    relist: Option<HashMap<ObjectKey, Arc<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            store: Store::default(),
            handlers: Vec::new(),
            relist: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Read handle on the cache populated by this informer
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Register a handler; handlers are called in registration order
    pub fn add_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Apply a single watch event
    pub fn apply(&mut self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Apply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                let obj = Arc::new(obj);
                match self.store.insert(key, Arc::clone(&obj)) {
                    None => self.handlers.iter().for_each(|h| h.on_add(&obj)),
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                }
            }
            WatchEvent::Delete(obj) => {
                let key = ObjectKey::from_resource(&obj);
                self.store.remove(&key);
                let obj = Arc::new(obj);
                self.handlers.iter().for_each(|h| h.on_delete(&obj));
            }
            WatchEvent::Init => {
                debug!(kind = self.kind, "Relist started");
                self.relist = Some(HashMap::new());
            }
            WatchEvent::InitApply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                self.relist
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
            }
            WatchEvent::InitDone => self.finish_relist(),
        }
    }

    fn finish_relist(&mut self) {
        let fresh = self.relist.take().unwrap_or_default();
        let mut previous = self.store.replace(fresh.clone());

        for (key, obj) in &fresh {
            match previous.remove(key) {
                None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
            }
        }
        for gone in previous.values() {
            self.handlers.iter().for_each(|h| h.on_delete(gone));
        }

        if !self.store.has_synced() {
            info!(kind = self.kind, objects = fresh.len(), "Cache synced");
        }
        self.store.mark_synced();
    }

    /// Drain `events` into the store until the stream ends or shutdown fires.
    ///
    /// Stream errors, including payloads that fail to decode, are logged and
    /// skipped; retrying cannot fix them and they must not stop the cache.
    pub async fn run<S, E>(mut self, events: S, mut shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = Result<WatchEvent<K>, E>>,
        E: Display,
    {
        info!(kind = self.kind, "Starting informer");
        let events = events.fuse();
        tokio::pin!(events);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        warn!(kind = self.kind, error = %e, "Dropping undecodable watch event");
                    }
                    None => {
                        warn!(kind = self.kind, "Watch stream ended");
                        break;
                    }
                },
            }
        }

        info!(kind = self.kind, "Informer stopped");
    }
}

/// Watch `api` with kube's watcher, retrying with the default backoff
pub fn watch_events<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = Result<WatchEvent<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config).default_backoff().map_ok(WatchEvent::from)
}
