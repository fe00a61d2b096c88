//! Watch-driven event dispatch for one resource kind
//!
//! A [`Dispatcher`] consumes a `kube` watch stream, applies each change to its
//! [`StoreWriter`] and then hands a [`ChangeEvent`] to every registered
//! listener, in registration order, awaiting each one. The store update
//! always happens before any listener sees the event, so a listener reading
//! the store observes the change it is being told about.
//!
//! Relists (`Init` .. `InitDone`) are reconciled against the store: objects
//! that were present before the relist but not returned by it are reported
//! as deletions. A re-delivered object whose `resourceVersion` did not move
//! produces no event.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cadence_common::{ChangeEvent, Store, StoreWriter};

use crate::task::TaskHandle;

/// Receives change events from a dispatcher
#[async_trait]
pub trait EventListener<K>: Send + Sync {
    async fn on_event(&self, event: &ChangeEvent<K>);
}

/// Shared listener handle
pub type SharedListener<K> = Arc<dyn EventListener<K>>;

/// Owns the store for one resource kind and fans out its changes
pub struct Dispatcher<K> {
    kind: &'static str,
    writer: StoreWriter<K>,
    listeners: Vec<SharedListener<K>>,
    relist: Option<HashSet<String>>,
}

impl<K> Dispatcher<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            writer: StoreWriter::new(),
            listeners: Vec::new(),
            relist: None,
        }
    }

    /// Read handle onto the store this dispatcher maintains
    pub fn store(&self) -> Store<K> {
        self.writer.reader()
    }

    /// Register a listener; listeners are called in the order they were added
    pub fn add_listener(&mut self, listener: SharedListener<K>) {
        self.listeners.push(listener);
    }

    /// Apply one watch event: update the store, then notify listeners
    pub async fn apply(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                debug!(kind = self.kind, "relist started");
                self.relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                if let Some(change) = self.upsert(obj) {
                    self.publish(change).await;
                }
            }
            watcher::Event::Delete(obj) => {
                let name = obj.name_any();
                if self.writer.remove(&name).is_some() {
                    self.publish(ChangeEvent::Deletion(obj)).await;
                } else {
                    trace!(kind = self.kind, name = %name, "delete for unknown object");
                }
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relist.take() else {
                    return;
                };
                let stale: Vec<String> = self
                    .writer
                    .reader()
                    .names()
                    .into_iter()
                    .filter(|name| !seen.contains(name))
                    .collect();
                debug!(kind = self.kind, stale = stale.len(), "relist finished");
                for name in stale {
                    if let Some(obj) = self.writer.remove(&name) {
                        self.publish(ChangeEvent::Deletion(obj)).await;
                    }
                }
            }
        }
    }

    fn upsert(&mut self, obj: K) -> Option<ChangeEvent<K>> {
        let name = obj.name_any();
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(name.clone());
        }

        let Some(prior) = self.writer.put(name.clone(), obj.clone()) else {
            return Some(ChangeEvent::Addition(obj));
        };
        let unchanged = match (prior.resource_version(), obj.resource_version()) {
            (Some(before), Some(after)) => before == after,
            _ => false,
        };
        if unchanged {
            trace!(kind = self.kind, name = %name, "resourceVersion unchanged");
            return None;
        }
        Some(ChangeEvent::Modification {
            prior,
            current: obj,
        })
    }

    async fn publish(&self, event: ChangeEvent<K>) {
        for listener in &self.listeners {
            listener.on_event(&event).await;
        }
    }

    /// Drive the dispatcher from `stream` until it ends or `cancel` fires
    ///
    /// Cancellation is observed between events; an event already being
    /// fanned out is delivered to every listener first.
    pub async fn run<S>(mut self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        let kind = self.kind;
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event).await,
                    Some(Err(e)) => warn!(kind, error = %e, "watch stream error"),
                    None => {
                        info!(kind, "watch stream ended");
                        break;
                    }
                },
            }
        }
        debug!(kind, "dispatcher stopped");
    }

    /// Start dispatching from an arbitrary event stream
    pub fn spawn_stream<S>(self, stream: S) -> TaskHandle
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let kind = self.kind;
        TaskHandle::spawn(kind, cancel.clone(), self.run(stream, cancel))
    }
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Start watching `api` with `config`
    pub fn spawn(self, api: Api<K>, config: watcher::Config) -> TaskHandle {
        info!(kind = self.kind, "starting watch");
        let stream = watcher(api, config).default_backoff();
        self.spawn_stream(stream)
    }
}
