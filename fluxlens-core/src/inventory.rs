//! Ownership resolution: which Services belong to which Flux object.
//!
//! Kustomizations record what they applied in `status.inventory`, HelmReleases are traced
//! through the manifest of the latest Helm release they produced.

use crate::prelude::*;

use crate::flux_resource::{FluxObject, HELM_NAME_LABEL};
use crate::helm::{HelmHistory, HelmReleaseRecord};
use crate::types::ObjectKey;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use tracing::{debug, warn};

const SERVICE_KIND: &str = "Service";

/// One `status.inventory.entries[].id` of a Kustomization, `<namespace>_<name>_<group>_<kind>`.
/// Core objects have an empty group (`default_web__Service`), cluster-scoped ones an empty
/// namespace (`_flux-system__Namespace`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InventoryEntry {
    pub namespace: String,
    pub name: String,
    pub group: String,
    pub kind: String,
}

impl InventoryEntry {
    pub fn parse(id: &str) -> Option<Self> {
        let parts: Vec<&str> = id.split('_').collect();
        if parts.len() < 4 {
            return None;
        }
        let kind = parts[parts.len() - 1];
        let group = parts[parts.len() - 2];
        let name = parts[1..parts.len() - 2].join("_");
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(InventoryEntry {
            namespace: parts[0].to_string(),
            name,
            group: group.to_string(),
            kind: kind.to_string(),
        })
    }

    pub fn is_core_service(&self) -> bool {
        self.kind == SERVICE_KIND && self.group.is_empty() && !self.namespace.is_empty()
    }
}

/// A Service identity resolved from an inventory or a Helm manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnedService {
    pub key: ObjectKey,
    pub helm_release: Option<String>,
}

/// Services recorded in a Kustomization's inventory.
pub fn inventory_services(kustomization: &FluxObject) -> Vec<OwnedService> {
    kustomization
        .inventory_ids()
        .into_iter()
        .filter_map(|id| {
            let entry = InventoryEntry::parse(id);
            if entry.is_none() {
                warn!(
                    "Unparseable inventory entry `{id}` in Kustomization {}/{}",
                    kustomization.namespace(),
                    kustomization.name()
                );
            }
            entry
        })
        .filter(InventoryEntry::is_core_service)
        .map(|entry| OwnedService {
            key: ObjectKey::new(entry.namespace, entry.name),
            helm_release: None,
        })
        .collect()
}

/// Where Helm stores the releases of a HelmRelease, and under which name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmReleaseTarget {
    pub helm_release: String,
    pub storage_namespace: String,
    pub release_namespace: String,
    pub release_name: String,
}

impl HelmReleaseTarget {
    pub fn from_helm_release(hr: &FluxObject) -> Self {
        let name = hr.name().to_string();
        let namespace = hr.namespace().to_string();
        let target_namespace = hr.spec_str("targetNamespace").map(str::to_string);
        let release_name = match (hr.spec_str("releaseName"), target_namespace.as_deref()) {
            (Some(release_name), _) => release_name.to_string(),
            (None, Some(target)) => format!("{target}-{name}"),
            (None, None) => name.clone(),
        };
        let storage_namespace = hr
            .spec_str("storageNamespace")
            .map(str::to_string)
            .or_else(|| target_namespace.clone())
            .unwrap_or_else(|| namespace.clone());
        HelmReleaseTarget {
            helm_release: name,
            release_namespace: target_namespace.unwrap_or(namespace),
            storage_namespace,
            release_name,
        }
    }
}

/// Highest `version` wins, timestamps are not considered.
pub fn latest_release(records: &[HelmReleaseRecord]) -> Option<&HelmReleaseRecord> {
    records.iter().max_by_key(|record| record.version)
}

/// Service documents of a rendered Helm manifest.
pub fn manifest_services(
    manifest: &str,
    release_namespace: &str,
    helm_release: &str,
) -> Vec<OwnedService> {
    let mut services = Vec::new();
    for (idx, document) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = match YamlValue::deserialize(document) {
            Ok(value) => value,
            Err(err) => {
                warn!("Skipping manifest document {idx} of HelmRelease {helm_release}: {err}");
                continue;
            }
        };
        let api_version = value.get("apiVersion").and_then(YamlValue::as_str);
        let kind = value.get("kind").and_then(YamlValue::as_str);
        if api_version != Some("v1") || kind != Some(SERVICE_KIND) {
            continue;
        }
        let metadata = value.get("metadata");
        let Some(name) = metadata
            .and_then(|m| m.get("name"))
            .and_then(YamlValue::as_str)
        else {
            warn!("Service document {idx} of HelmRelease {helm_release} has no name");
            continue;
        };
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(YamlValue::as_str)
            .unwrap_or(release_namespace);
        let owner = metadata
            .and_then(|m| m.get("labels"))
            .and_then(|labels| labels.get(HELM_NAME_LABEL))
            .and_then(YamlValue::as_str)
            .unwrap_or(helm_release);
        services.push(OwnedService {
            key: ObjectKey::new(namespace, name),
            helm_release: Some(owner.to_string()),
        });
    }
    services
}

/// Services of every HelmRelease, in the order the releases are given. A HelmRelease
/// without a Helm release in storage is skipped, a failing history lookup aborts.
pub async fn resolve_helm_services(
    helm: &dyn HelmHistory,
    helm_releases: &[FluxObject],
) -> Result<Vec<OwnedService>> {
    let mut services = Vec::new();
    for hr in helm_releases {
        let target = HelmReleaseTarget::from_helm_release(hr);
        let history = helm
            .history(&target.storage_namespace, &target.release_name)
            .await?;
        let Some(latest) = latest_release(&history) else {
            warn!(
                "No Helm release `{}` found in namespace {} for HelmRelease {}/{}, skipping",
                target.release_name,
                target.storage_namespace,
                hr.namespace(),
                hr.name()
            );
            continue;
        };
        let release_namespace = if latest.namespace.is_empty() {
            target.release_namespace.as_str()
        } else {
            latest.namespace.as_str()
        };
        let found = manifest_services(&latest.manifest, release_namespace, &target.helm_release);
        debug!(
            "HelmRelease {}/{} v{} owns {} service(s)",
            hr.namespace(),
            hr.name(),
            latest.version,
            found.len()
        );
        services.extend(found);
    }
    Ok(services)
}
