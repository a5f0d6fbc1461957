//! Bridges `kube::runtime::watcher` streams into the live store.
//!
//! The watcher does not tell an add from an update, and after a re-list it does not report
//! objects that vanished while it was disconnected. [`EventClassifier`] reconstructs both.

use crate::flux_resource::{HELM_NAME_LABEL, KUSTOMIZE_NAME_LABEL};
use crate::store::actor::StoreHandle;
use crate::store::{StoreEvent, WatchEvent};
use crate::types::ObjectKey;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::any::type_name;
use std::collections::HashSet;
use std::fmt::Debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct EventClassifier {
    seen: HashSet<ObjectKey>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify<K: Resource>(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let Some(key) = ObjectKey::from_meta(obj.meta()) else {
                    warn!("Dropping {} without name or namespace", type_name::<K>());
                    return Vec::new();
                };
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                if self.seen.insert(key) {
                    vec![WatchEvent::Created(obj)]
                } else {
                    vec![WatchEvent::Updated(obj)]
                }
            }
            watcher::Event::Delete(obj) => match ObjectKey::from_meta(obj.meta()) {
                Some(key) => {
                    self.seen.remove(&key);
                    vec![WatchEvent::Deleted(key)]
                }
                None => Vec::new(),
            },
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let stale: Vec<ObjectKey> = self
                    .seen
                    .iter()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                stale
                    .into_iter()
                    .map(|key| {
                        self.seen.remove(&key);
                        WatchEvent::Deleted(key)
                    })
                    .collect()
            }
        }
    }
}

/// Which Services the live store follows: those the aggregator resolved, plus anything
/// labelled as applied by Flux. Once a Service has been forwarded it is followed until it is
/// deleted, and the first admitted event for a key always reaches the store as Created.
#[derive(Debug, Clone, Default)]
pub struct ServiceAdmission {
    resolved: HashSet<ObjectKey>,
    forwarded: HashSet<ObjectKey>,
}

impl ServiceAdmission {
    pub fn new(resolved: impl IntoIterator<Item = ObjectKey>) -> Self {
        ServiceAdmission {
            resolved: resolved.into_iter().collect(),
            forwarded: HashSet::new(),
        }
    }

    pub fn admits(&self, service: &Service) -> bool {
        if ObjectKey::from_meta(&service.metadata).is_some_and(|key| self.resolved.contains(&key))
        {
            return true;
        }
        service
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| {
                labels.contains_key(KUSTOMIZE_NAME_LABEL) || labels.contains_key(HELM_NAME_LABEL)
            })
    }

    /// Decides what the store sees for a classified Service event, if anything.
    pub fn forward(&mut self, event: WatchEvent<Service>) -> Option<WatchEvent<Service>> {
        match event {
            WatchEvent::Created(service) | WatchEvent::Updated(service) => {
                let key = ObjectKey::from_meta(&service.metadata)?;
                if self.forwarded.contains(&key) {
                    return Some(WatchEvent::Updated(service));
                }
                if !self.admits(&service) {
                    return None;
                }
                debug!("Admitting Service {key}");
                self.forwarded.insert(key);
                Some(WatchEvent::Created(service))
            }
            WatchEvent::Deleted(key) => {
                self.forwarded.remove(&key);
                Some(WatchEvent::Deleted(key))
            }
        }
    }
}

/// Starts one watcher task per kind. Tasks end when `cancel` fires or the store goes away.
pub fn spawn_watchers(
    client: Client,
    namespace: Option<&str>,
    store: StoreHandle,
    mut admission: ServiceAdmission,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    vec![
        tokio::spawn(watch_kind(
            api::<Service>(&client, namespace),
            store.clone(),
            cancel.clone(),
            move |event| admission.forward(event).map(StoreEvent::Service),
        )),
        tokio::spawn(watch_kind(
            api::<Deployment>(&client, namespace),
            store.clone(),
            cancel.clone(),
            |event| Some(StoreEvent::Deployment(event)),
        )),
        tokio::spawn(watch_kind(
            api::<Pod>(&client, namespace),
            store.clone(),
            cancel.clone(),
            |event| Some(StoreEvent::Pod(event)),
        )),
        tokio::spawn(watch_kind(
            api::<Ingress>(&client, namespace),
            store,
            cancel,
            |event| Some(StoreEvent::Ingress(event)),
        )),
    ]
}

async fn watch_kind<K, F>(
    api: Api<K>,
    store: StoreHandle,
    cancel: CancellationToken,
    mut to_store: F,
)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Clone + Eq + std::hash::Hash + Send + Sync + 'static,
    F: FnMut(WatchEvent<K>) -> Option<StoreEvent> + Send + 'static,
{
    let kind = type_name::<K>().rsplit("::").next().unwrap_or_default();
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut classifier = EventClassifier::new();
    let mut error_count = 0u32;
    info!("Watching {kind}");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(next) = next else {
            warn!("{kind} watch stream ended");
            break;
        };
        let event = match next {
            Ok(event) => {
                error_count = 0;
                event
            }
            Err(err) => {
                error_count += 1;
                if error_count == 1 || error_count.is_multiple_of(10) {
                    warn!("Error in {kind} watch ({error_count}): {err}");
                }
                continue;
            }
        };
        for classified in classifier.classify(event) {
            let classified = match classified {
                WatchEvent::Created(mut obj) => {
                    obj.managed_fields_mut().clear();
                    WatchEvent::Created(obj)
                }
                WatchEvent::Updated(mut obj) => {
                    obj.managed_fields_mut().clear();
                    WatchEvent::Updated(obj)
                }
                deleted => deleted,
            };
            let Some(store_event) = to_store(classified) else {
                continue;
            };
            if let Err(err) = store.send(store_event).await {
                warn!("Stopping {kind} watch: {err}");
                return;
            }
        }
    }
    debug!("{kind} watch stopped");
}
