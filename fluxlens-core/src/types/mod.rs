use crate::flux_resource::{FluxObject, FluxResourceKind};
use crate::selector::Labels;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Namespaced identity of a cluster object.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Hash, Ord, PartialOrd)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `None` when either the name or the namespace is missing.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = meta.namespace.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IngressRef {
    pub namespace: String,
    pub name: String,
    pub url: Option<String>,
}

impl IngressRef {
    pub fn from_ingress(ingress: &Ingress) -> Option<Self> {
        let key = ObjectKey::from_meta(&ingress.metadata)?;
        Some(IngressRef {
            namespace: key.namespace,
            name: key.name,
            url: ingress_url(ingress),
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

/// URL of the first rule that names a host. TLS-covered hosts get `https`.
pub fn ingress_url(ingress: &Ingress) -> Option<String> {
    let spec = ingress.spec.as_ref()?;
    let host = spec
        .rules
        .iter()
        .flatten()
        .find_map(|rule| rule.host.as_deref().filter(|h| !h.is_empty()))?;
    let is_tls = spec
        .tls
        .iter()
        .flatten()
        .flat_map(|tls| tls.hosts.iter().flatten())
        .any(|tls_host| tls_host == host);
    let scheme = if is_tls { "https" } else { "http" };
    Some(format!("{scheme}://{host}"))
}

/// Names of the Services referenced by any rule path of the Ingress.
pub fn ingress_backend_services(ingress: &Ingress) -> BTreeSet<String> {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .flat_map(|rule| rule.http.iter())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref().map(|s| s.name.clone()))
        .collect()
}

/// A Service together with the workload objects correlated to it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ManagedService {
    pub service: Service,
    pub deployment: Option<Deployment>,
    pub pods: Vec<Pod>,
    pub ingresses: Vec<IngressRef>,
    pub helm_release: Option<String>,
}

impl ManagedService {
    pub fn new(service: Service, helm_release: Option<String>) -> Self {
        ManagedService {
            service,
            deployment: None,
            pods: Vec::new(),
            ingresses: Vec::new(),
            helm_release,
        }
    }

    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::from_meta(&self.service.metadata)
    }

    pub fn namespace(&self) -> &str {
        self.service.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.service.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn selector(&self) -> Option<&Labels> {
        service_selector(&self.service)
    }

    pub fn has_pod(&self, key: &ObjectKey) -> bool {
        self.pods
            .iter()
            .any(|pod| ObjectKey::from_meta(&pod.metadata).as_ref() == Some(key))
    }

    pub fn deployment_key(&self) -> Option<ObjectKey> {
        self.deployment
            .as_ref()
            .and_then(|d| ObjectKey::from_meta(&d.metadata))
    }
}

pub fn service_selector(service: &Service) -> Option<&Labels> {
    service.spec.as_ref().and_then(|spec| spec.selector.as_ref())
}

pub fn deployment_selector(deployment: &Deployment) -> Option<&Labels> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.match_labels.as_ref())
}

/// Condensed view of a Flux object for the overview pages.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FluxResourceSummary {
    pub kind: FluxResourceKind,
    pub namespace: String,
    pub name: String,
    pub ready: Option<bool>,
    pub suspended: bool,
    pub message: Option<String>,
    pub revision: Option<String>,
    pub last_handled_reconcile_at: Option<String>,
    pub object: FluxObject,
}

impl FluxResourceSummary {
    pub fn new(kind: FluxResourceKind, object: FluxObject) -> Self {
        let ready = object.ready_condition();
        FluxResourceSummary {
            kind,
            namespace: object.namespace().to_string(),
            name: object.name().to_string(),
            ready: ready.as_ref().map(|c| c.is_true()),
            suspended: object.is_suspended(),
            message: ready.and_then(|c| c.message),
            revision: object.revision().map(str::to_string),
            last_handled_reconcile_at: object.last_handled_reconcile_at().map(str::to_string),
            object,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct FluxState {
    pub git_repositories: Vec<FluxResourceSummary>,
    pub oci_repositories: Vec<FluxResourceSummary>,
    pub buckets: Vec<FluxResourceSummary>,
    pub helm_releases: Vec<FluxResourceSummary>,
    pub kustomizations: Vec<FluxResourceSummary>,
    pub flux_services: Vec<Service>,
}
