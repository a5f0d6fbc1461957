use crate::prelude::*;

use crate::errors::ErrorKind;
use crate::types::ObjectKey;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter};

pub const FLUX_SYSTEM_NAMESPACE: &str = "flux-system";
pub const RECONCILE_REQUESTED_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";
pub const RECONCILE_FORCE_AT_ANNOTATION: &str = "reconcile.fluxcd.io/forceAt";
pub const KUSTOMIZE_NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
pub const HELM_NAME_LABEL: &str = "helm.toolkit.fluxcd.io/name";

/// How readiness of a kind is judged after a resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// `Ready` condition at the current generation.
    Condition,
    /// The kind carries no conditions, fetching it without error is enough.
    Static,
}

#[derive(Clone, Copy, Debug)]
struct KindDescriptor {
    group: &'static str,
    version: &'static str,
    plural: &'static str,
    readiness: Readiness,
    reconcilable: bool,
}

impl KindDescriptor {
    const fn reconcilable(group: &'static str, version: &'static str, plural: &'static str) -> Self {
        Self {
            group,
            version,
            plural,
            readiness: Readiness::Condition,
            reconcilable: true,
        }
    }

    const fn static_kind(group: &'static str, version: &'static str, plural: &'static str) -> Self {
        Self {
            group,
            version,
            plural,
            readiness: Readiness::Static,
            reconcilable: false,
        }
    }
}

const KUSTOMIZE_GROUP: &str = "kustomize.toolkit.fluxcd.io";
const HELM_GROUP: &str = "helm.toolkit.fluxcd.io";
const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";
const NOTIFICATION_GROUP: &str = "notification.toolkit.fluxcd.io";
const TF_CONTROLLER_GROUP: &str = "infra.contrib.fluxcd.io";

/// Every Flux object kind the dashboard can inspect and operate on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter, Display,
)]
pub enum FluxResourceKind {
    Kustomization,
    HelmRelease,
    GitRepository,
    OCIRepository,
    Bucket,
    Terraform,
    Alert,
    Provider,
}

impl FluxResourceKind {
    fn descriptor(self) -> KindDescriptor {
        match self {
            FluxResourceKind::Kustomization => {
                KindDescriptor::reconcilable(KUSTOMIZE_GROUP, "v1", "kustomizations")
            }
            FluxResourceKind::HelmRelease => {
                KindDescriptor::reconcilable(HELM_GROUP, "v2", "helmreleases")
            }
            FluxResourceKind::GitRepository => {
                KindDescriptor::reconcilable(SOURCE_GROUP, "v1", "gitrepositories")
            }
            FluxResourceKind::OCIRepository => {
                KindDescriptor::reconcilable(SOURCE_GROUP, "v1beta2", "ocirepositories")
            }
            FluxResourceKind::Bucket => KindDescriptor::reconcilable(SOURCE_GROUP, "v1beta2", "buckets"),
            FluxResourceKind::Terraform => {
                KindDescriptor::reconcilable(TF_CONTROLLER_GROUP, "v1alpha2", "terraforms")
            }
            FluxResourceKind::Alert => KindDescriptor::static_kind(NOTIFICATION_GROUP, "v1beta3", "alerts"),
            FluxResourceKind::Provider => {
                KindDescriptor::static_kind(NOTIFICATION_GROUP, "v1beta3", "providers")
            }
        }
    }

    pub fn api_resource(self) -> ApiResource {
        let descriptor = self.descriptor();
        let gvk = GroupVersionKind::gvk(descriptor.group, descriptor.version, &self.to_string());
        ApiResource::from_gvk_with_plural(&gvk, descriptor.plural)
    }

    pub fn plural(self) -> &'static str {
        self.descriptor().plural
    }

    pub fn readiness(self) -> Readiness {
        self.descriptor().readiness
    }

    pub fn is_reconcilable(self) -> bool {
        self.descriptor().reconcilable
    }

    /// Accepts the kind name, its plural, or the lowercase forms the UI routes use.
    pub fn parse(value: &str) -> Result<Self> {
        use strum::IntoEnumIterator;
        FluxResourceKind::iter()
            .find(|kind| {
                value.eq_ignore_ascii_case(&kind.to_string()) || value.eq_ignore_ascii_case(kind.plural())
            })
            .ok_or_else(|| ErrorKind::InvalidResourceTypeError(value.to_string()).into())
    }

    /// Human-readable message reported once an operation on `obj` has settled.
    pub fn success_message(self, obj: &FluxObject) -> String {
        match self {
            FluxResourceKind::Kustomization
            | FluxResourceKind::HelmRelease
            | FluxResourceKind::Terraform => match obj.revision() {
                Some(revision) => format!("applied revision {revision}"),
                None => format!("{self} reconciliation completed"),
            },
            FluxResourceKind::GitRepository
            | FluxResourceKind::OCIRepository
            | FluxResourceKind::Bucket => match obj.revision() {
                Some(revision) => format!("fetched revision {revision}"),
                None => format!("{self} reconciliation completed"),
            },
            FluxResourceKind::Alert | FluxResourceKind::Provider => format!("{self} is ready"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl StatusCondition {
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// A Flux custom resource read through the dynamic API. Accessors read the well-known
/// fields every toolkit controller exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FluxObject(pub DynamicObject);

impl FluxObject {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(FluxObject(serde_json::from_value(value)?))
    }

    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::from_meta(&self.0.metadata)
    }

    pub fn name(&self) -> &str {
        self.0.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.0.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.0.metadata.resource_version.as_deref()
    }

    pub fn generation(&self) -> Option<i64> {
        self.0.metadata.generation
    }

    pub fn spec(&self) -> Option<&Value> {
        self.0.data.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.data.get("status")
    }

    pub fn spec_str(&self, field: &str) -> Option<&str> {
        self.spec()
            .and_then(|spec| spec.get(field))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_suspended(&self) -> bool {
        self.spec()
            .and_then(|spec| spec.get("suspend"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status()
            .and_then(|status| status.get("observedGeneration"))
            .and_then(Value::as_i64)
    }

    pub fn last_handled_reconcile_at(&self) -> Option<&str> {
        self.status()
            .and_then(|status| status.get("lastHandledReconcileAt"))
            .and_then(Value::as_str)
    }

    pub fn conditions(&self) -> Vec<StatusCondition> {
        self.status()
            .and_then(|status| status.get("conditions"))
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn condition(&self, type_: &str) -> Option<StatusCondition> {
        self.conditions().into_iter().find(|c| c.type_ == type_)
    }

    pub fn ready_condition(&self) -> Option<StatusCondition> {
        self.condition("Ready")
    }

    pub fn is_observed(&self) -> bool {
        match (self.generation(), self.observed_generation()) {
            (Some(generation), Some(observed)) => generation == observed,
            _ => false,
        }
    }

    pub fn revision(&self) -> Option<&str> {
        let status = self.status()?;
        status
            .get("lastAppliedRevision")
            .and_then(Value::as_str)
            .or_else(|| {
                status
                    .get("artifact")
                    .and_then(|artifact| artifact.get("revision"))
                    .and_then(Value::as_str)
            })
            .or_else(|| {
                status
                    .get("history")
                    .and_then(Value::as_array)
                    .and_then(|history| history.first())
                    .and_then(|snapshot| snapshot.get("chartVersion"))
                    .and_then(Value::as_str)
            })
            .filter(|s| !s.is_empty())
    }

    /// Raw `status.inventory.entries[].id` values of a Kustomization.
    pub fn inventory_ids(&self) -> Vec<&str> {
        self.status()
            .and_then(|status| status.get("inventory"))
            .and_then(|inventory| inventory.get("entries"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("id").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}
