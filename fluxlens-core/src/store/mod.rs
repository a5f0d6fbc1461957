//! In-memory view of the managed Services, kept current by watch events.
//!
//! [`ServiceStore`] is the synchronous state machine; [`actor::StoreHandle`] owns one and is
//! the only writer. Besides the records, the store remembers every Deployment, Pod and Ingress
//! it has been told about, so a Service that shows up late still gets its workload attached.

pub mod actor;

use crate::prelude::*;

use crate::aggregator::{matching_deployment, matching_ingresses, matching_pods};
use crate::errors::ErrorKind;
use crate::flux_resource::HELM_NAME_LABEL;
use crate::selector::{selectors_equal, selects_pod};
use crate::types::{
    deployment_selector, ingress_backend_services, ingress_url, service_selector, IngressRef,
    ManagedService, ObjectKey,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Created(T),
    Updated(T),
    Deleted(ObjectKey),
}

#[derive(Debug, Clone, PartialEq, Display)]
pub enum StoreEvent {
    Service(WatchEvent<Service>),
    Deployment(WatchEvent<Deployment>),
    Pod(WatchEvent<Pod>),
    Ingress(WatchEvent<Ingress>),
}

pub type ServiceSnapshot = Arc<Vec<ManagedService>>;

#[derive(Debug, Default, Clone)]
pub struct ServiceStore {
    services: ServiceSnapshot,
    deployments: BTreeMap<ObjectKey, Deployment>,
    pods: BTreeMap<ObjectKey, Pod>,
    ingresses: BTreeMap<ObjectKey, Ingress>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an aggregation result. Attached workload objects become observed ones.
    pub fn seeded(services: Vec<ManagedService>) -> Self {
        let mut store = ServiceStore::new();
        for record in &services {
            if let Some(deployment) = &record.deployment {
                if let Some(key) = ObjectKey::from_meta(&deployment.metadata) {
                    store.deployments.insert(key, deployment.clone());
                }
            }
            for pod in &record.pods {
                if let Some(key) = ObjectKey::from_meta(&pod.metadata) {
                    store.pods.insert(key, pod.clone());
                }
            }
        }
        store.services = Arc::new(services);
        store
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.services.clone()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ManagedService> {
        self.services.iter().find(|r| r.key().as_ref() == Some(key))
    }

    /// Applies one event. Snapshots handed out earlier are never modified, the record
    /// vector is copied on write. Payloads without a name or namespace are rejected.
    pub fn apply(&mut self, event: StoreEvent) -> Result<()> {
        trace!("Applying {event}");
        match event {
            StoreEvent::Service(WatchEvent::Created(service)) => self.service_created(service),
            StoreEvent::Service(WatchEvent::Updated(service)) => self.service_updated(service),
            StoreEvent::Service(WatchEvent::Deleted(key)) => {
                self.service_deleted(&key);
                Ok(())
            }
            StoreEvent::Deployment(WatchEvent::Created(deployment))
            | StoreEvent::Deployment(WatchEvent::Updated(deployment)) => {
                self.deployment_applied(deployment)
            }
            StoreEvent::Deployment(WatchEvent::Deleted(key)) => {
                self.deployment_deleted(&key);
                Ok(())
            }
            StoreEvent::Pod(WatchEvent::Created(pod)) | StoreEvent::Pod(WatchEvent::Updated(pod)) => {
                self.pod_applied(pod)
            }
            StoreEvent::Pod(WatchEvent::Deleted(key)) => {
                self.pod_deleted(&key);
                Ok(())
            }
            StoreEvent::Ingress(WatchEvent::Created(ingress)) => self.ingress_created(ingress),
            StoreEvent::Ingress(WatchEvent::Updated(ingress)) => self.ingress_updated(ingress),
            StoreEvent::Ingress(WatchEvent::Deleted(key)) => {
                self.ingress_deleted(&key);
                Ok(())
            }
        }
    }

    fn records_mut(&mut self) -> &mut Vec<ManagedService> {
        Arc::make_mut(&mut self.services)
    }

    fn position(&self, key: &ObjectKey) -> Option<usize> {
        self.services
            .iter()
            .position(|r| r.key().as_ref() == Some(key))
    }

    fn attach_observed(&self, record: &mut ManagedService) {
        let ns = record.namespace().to_string();
        let selector = record.selector().cloned();
        record.deployment = matching_deployment(
            selector.as_ref(),
            self.deployments
                .iter()
                .filter(|(key, _)| key.namespace == ns)
                .map(|(_, d)| d),
        )
        .cloned();
        record.pods = matching_pods(&ns, selector.as_ref(), self.pods.values());
    }

    fn service_created(&mut self, service: Service) -> Result<()> {
        let key = key_of(&service.metadata, "Service")?;
        if self.position(&key).is_some() {
            debug!("Service {key} already tracked");
            return Ok(());
        }
        let helm_release = service
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(HELM_NAME_LABEL))
            .cloned();
        let mut record = ManagedService::new(service, helm_release);
        self.attach_observed(&mut record);
        record.ingresses = matching_ingresses(&key.namespace, &key.name, self.ingresses.values());
        debug!(
            "Tracking Service {key} with {} pod(s), deployment: {:?}",
            record.pods.len(),
            record.deployment_key()
        );
        self.records_mut().push(record);
        Ok(())
    }

    /// A Service listed by both an inventory and a Helm release has two records, both follow.
    fn service_updated(&mut self, service: Service) -> Result<()> {
        let key = key_of(&service.metadata, "Service")?;
        let targets: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, r)| r.key().as_ref() == Some(&key))
            .map(|(idx, _)| idx)
            .collect();
        if targets.is_empty() {
            debug!("Update for untracked Service {key} ignored");
            return Ok(());
        }
        for idx in targets {
            let selector_changed = !selectors_equal(
                self.services[idx].selector(),
                service_selector(&service),
            );
            let mut record = self.services[idx].clone();
            record.service = service.clone();
            if selector_changed {
                debug!("Selector of Service {key} changed, re-deriving workload");
                self.attach_observed(&mut record);
            }
            self.records_mut()[idx] = record;
        }
        Ok(())
    }

    fn service_deleted(&mut self, key: &ObjectKey) {
        if self.position(key).is_none() {
            return;
        }
        self.records_mut()
            .retain(|r| r.key().as_ref() != Some(key));
        debug!("Service {key} removed");
    }

    fn deployment_applied(&mut self, deployment: Deployment) -> Result<()> {
        let key = key_of(&deployment.metadata, "Deployment")?;
        let selector = deployment_selector(&deployment).cloned();
        self.deployments.insert(key.clone(), deployment);
        let affected: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, r)| r.namespace() == key.namespace)
            .filter(|(_, r)| {
                let holds = r.deployment_key().as_ref() == Some(&key);
                let matches = r.selector().is_some_and(|s| !s.is_empty())
                    && selectors_equal(r.selector(), selector.as_ref());
                holds || matches
            })
            .map(|(idx, _)| idx)
            .collect();
        if affected.is_empty() {
            trace!("Deployment {key} matches no tracked Service");
            return Ok(());
        }
        for idx in affected {
            self.refresh_deployment(idx);
        }
        Ok(())
    }

    fn deployment_deleted(&mut self, key: &ObjectKey) {
        self.deployments.remove(key);
        let affected: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, r)| r.deployment_key().as_ref() == Some(key))
            .map(|(idx, _)| idx)
            .collect();
        for idx in affected {
            self.refresh_deployment(idx);
        }
    }

    fn refresh_deployment(&mut self, idx: usize) {
        let record = &self.services[idx];
        let ns = record.namespace().to_string();
        let deployment = matching_deployment(
            record.selector(),
            self.deployments
                .iter()
                .filter(|(key, _)| key.namespace == ns)
                .map(|(_, d)| d),
        )
        .cloned();
        self.records_mut()[idx].deployment = deployment;
    }

    /// Created and Updated alike: membership follows the current labels.
    fn pod_applied(&mut self, pod: Pod) -> Result<()> {
        let key = key_of(&pod.metadata, "Pod")?;
        self.pods.insert(key.clone(), pod.clone());
        let changes: Vec<(usize, bool, Option<usize>)> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, r)| r.namespace() == key.namespace)
            .map(|(idx, r)| (idx, selects_pod(r.selector(), &pod), pod_position(r, &key)))
            .filter(|(_, selected, present)| *selected || present.is_some())
            .collect();
        if changes.is_empty() {
            return Ok(());
        }
        let records = self.records_mut();
        for (idx, selected, present) in changes {
            let pods = &mut records[idx].pods;
            match (selected, present) {
                (true, Some(pos)) => pods[pos] = pod.clone(),
                (true, None) => {
                    let at = pods
                        .partition_point(|p| p.metadata.name.as_deref() < Some(key.name.as_str()));
                    pods.insert(at, pod.clone());
                }
                (false, Some(pos)) => {
                    pods.remove(pos);
                }
                (false, None) => {}
            }
        }
        Ok(())
    }

    fn pod_deleted(&mut self, key: &ObjectKey) {
        self.pods.remove(key);
        if !self.services.iter().any(|r| r.has_pod(key)) {
            return;
        }
        for record in self.records_mut().iter_mut() {
            record
                .pods
                .retain(|p| ObjectKey::from_meta(&p.metadata).as_ref() != Some(key));
        }
    }

    fn ingress_created(&mut self, ingress: Ingress) -> Result<()> {
        let key = key_of(&ingress.metadata, "Ingress")?;
        let backends = ingress_backend_services(&ingress);
        let url = ingress_url(&ingress);
        self.ingresses.insert(key.clone(), ingress);
        let targets: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, r)| r.namespace() == key.namespace && backends.contains(r.name()))
            .map(|(idx, _)| idx)
            .collect();
        let records = self.records_mut();
        for idx in targets {
            let ingresses = &mut records[idx].ingresses;
            if ingresses.iter().any(|i| i.name == key.name) {
                continue;
            }
            let at = ingresses.partition_point(|i| i.name < key.name);
            ingresses.insert(
                at,
                IngressRef {
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    url: url.clone(),
                },
            );
        }
        Ok(())
    }

    /// Only the URL of already attached references changes.
    fn ingress_updated(&mut self, ingress: Ingress) -> Result<()> {
        let key = key_of(&ingress.metadata, "Ingress")?;
        let url = ingress_url(&ingress);
        self.ingresses.insert(key.clone(), ingress);
        if !self.services.iter().any(|r| holds_ingress(r, &key)) {
            return Ok(());
        }
        for record in self.records_mut().iter_mut() {
            for ingress_ref in record.ingresses.iter_mut().filter(|i| i.key() == key) {
                ingress_ref.url = url.clone();
            }
        }
        Ok(())
    }

    fn ingress_deleted(&mut self, key: &ObjectKey) {
        self.ingresses.remove(key);
        if !self.services.iter().any(|r| holds_ingress(r, key)) {
            return;
        }
        for record in self.records_mut().iter_mut() {
            record.ingresses.retain(|i| &i.key() != key);
        }
    }
}

fn key_of(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kind: &str,
) -> Result<ObjectKey> {
    ObjectKey::from_meta(meta).ok_or_else(|| {
        ErrorKind::MalformedEvent(format!(
            "{kind} without name or namespace (name: {:?}, namespace: {:?})",
            meta.name, meta.namespace
        ))
        .into()
    })
}

fn pod_position(record: &ManagedService, key: &ObjectKey) -> Option<usize> {
    record
        .pods
        .iter()
        .position(|p| ObjectKey::from_meta(&p.metadata).as_ref() == Some(key))
}

fn holds_ingress(record: &ManagedService, key: &ObjectKey) -> bool {
    record.ingresses.iter().any(|i| &i.key() == key)
}
