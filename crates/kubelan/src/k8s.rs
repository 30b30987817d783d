//! Kubernetes EndpointSlice watch source
//!
//! Watches EndpointSlices in all namespaces and turns watcher events into
//! [`EndpointChangeEvent`]s. A slice seen for the first time is Added and
//! Updated afterwards. When the watcher relists after a disconnect, slices
//! that disappeared in the meantime are reported as Deleted.

use crate::error::Result;
use crate::types::{ChangeKind, EndpointChangeEvent, OwnerRef, SliceKey, SliceResource};
use crate::watch::WatchSource;
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Buffered events between the watcher task and the dispatch loop
const EVENT_BUFFER: usize = 256;

/// Converts an EndpointSlice into the watch-source independent form.
///
/// Returns None for objects without a namespace or name.
pub fn slice_resource(slice: &EndpointSlice) -> Option<SliceResource> {
    let namespace = slice.metadata.namespace.clone()?;
    let name = slice.metadata.name.clone()?;

    let owners = slice
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|owner| OwnerRef {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        })
        .collect();

    let addresses = slice
        .endpoints
        .iter()
        .flat_map(|endpoint| endpoint.addresses.iter().cloned())
        .collect();

    Some(SliceResource {
        namespace,
        name,
        owners,
        addresses,
    })
}

/// Tracks which slices have been reported to classify watcher events.
#[derive(Debug, Default)]
pub struct SliceTracker {
    known: HashMap<SliceKey, SliceResource>,
    /// Keys seen during an in-progress relist
    relisted: Option<HashSet<SliceKey>>,
}

impl SliceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one watcher event into zero or more change events
    pub fn handle(&mut self, event: Event<EndpointSlice>) -> Vec<EndpointChangeEvent> {
        match event {
            Event::Apply(slice) => self.apply(&slice).into_iter().collect(),
            Event::Delete(slice) => self.delete(&slice).into_iter().collect(),
            Event::Init => {
                debug!("EndpointSlice relist started");
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(slice) => {
                if let (Some(seen), Some(resource)) =
                    (self.relisted.as_mut(), slice_resource(&slice))
                {
                    seen.insert(resource.key());
                }
                self.apply(&slice).into_iter().collect()
            }
            Event::InitDone => self.finish_relist(),
        }
    }

    pub fn known_slices(&self) -> usize {
        self.known.len()
    }

    fn apply(&mut self, slice: &EndpointSlice) -> Option<EndpointChangeEvent> {
        let resource = slice_resource(slice)?;
        let key = resource.key();
        trace!(slice = %key, "EndpointSlice applied");

        let kind = if self.known.contains_key(&key) {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        let event = EndpointChangeEvent::from_resource(kind, &resource);
        self.known.insert(key, resource);
        event
    }

    fn delete(&mut self, slice: &EndpointSlice) -> Option<EndpointChangeEvent> {
        let resource = slice_resource(slice)?;
        trace!(slice = %resource.key(), "EndpointSlice deleted");

        self.known.remove(&resource.key());
        EndpointChangeEvent::from_resource(ChangeKind::Deleted, &resource)
    }

    fn finish_relist(&mut self) -> Vec<EndpointChangeEvent> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };

        let vanished: Vec<SliceKey> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();

        debug!(
            slices = seen.len(),
            vanished = vanished.len(),
            "EndpointSlice relist complete"
        );

        let mut events: Vec<EndpointChangeEvent> = vanished
            .into_iter()
            .filter_map(|key| self.known.remove(&key))
            .filter_map(|resource| {
                EndpointChangeEvent::from_resource(ChangeKind::Deleted, &resource)
            })
            .collect();
        events.sort_by(|a, b| a.slice().cmp(b.slice()));
        events
    }
}

/// Watch source backed by a Kubernetes EndpointSlice watcher task
pub struct EndpointSliceWatcher {
    events: mpsc::Receiver<EndpointChangeEvent>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EndpointSliceWatcher {
    /// Start watching EndpointSlices in every namespace
    pub fn spawn(client: Client) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let api: Api<EndpointSlice> = Api::all(client);

        let task = tokio::spawn(watch_slices(api, tx, token.clone()));
        info!("Watching EndpointSlices");

        Self {
            events: rx,
            token,
            task: Some(task),
        }
    }

    /// Start watching using the ambient kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::spawn(client))
    }
}

async fn watch_slices(
    api: Api<EndpointSlice>,
    tx: mpsc::Sender<EndpointChangeEvent>,
    token: CancellationToken,
) {
    let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
    let mut tracker = SliceTracker::new();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.try_next() => next,
        };

        match next {
            Ok(Some(event)) => {
                for change in tracker.handle(event) {
                    if tx.send(change).await.is_err() {
                        debug!("Event receiver dropped, stopping EndpointSlice watch");
                        return;
                    }
                }
            }
            Ok(None) => {
                warn!("EndpointSlice watch stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "EndpointSlice watch error, retrying");
            }
        }
    }

    debug!("EndpointSlice watch stopped");
}

#[async_trait]
impl WatchSource for EndpointSliceWatcher {
    async fn next_event(&mut self) -> Option<EndpointChangeEvent> {
        self.events.recv().await
    }

    async fn stop(&mut self) {
        self.token.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "EndpointSlice watch task failed");
            }
        }
    }
}
