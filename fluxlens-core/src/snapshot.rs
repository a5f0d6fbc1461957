use crate::prelude::*;

use crate::errors::ErrorKind;
use crate::flux_resource::{FluxObject, FluxResourceKind};
use crate::flux_state::list_flux_kind;
use crate::helm::{HelmHistory, HelmReleaseRecord};
use crate::inventory::HelmReleaseTarget;
use crate::kube_client::KubeClient;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const SNAPSHOT_CLUSTER_FILE: &str = "cluster.json";
pub const SNAPSHOT_SERVICES_FILE: &str = "services.json";
pub const SNAPSHOT_DEPLOYMENTS_FILE: &str = "deployments.json";
pub const SNAPSHOT_PODS_FILE: &str = "pods.json";
pub const SNAPSHOT_INGRESSES_FILE: &str = "ingresses.json";
pub const SNAPSHOT_EVENTS_FILE: &str = "events.json";
pub const SNAPSHOT_HELM_HISTORY_FILE: &str = "helm_history.json";
pub const SNAPSHOT_POD_LOGS_FILE: &str = "pod_logs.json";

/// Flux objects live in `<plural>.json`, e.g. `kustomizations.json`.
pub fn flux_snapshot_file(kind: FluxResourceKind) -> String {
    format!("{}.json", kind.plural())
}

pub fn pod_log_key(namespace: &str, pod: &str, container: &str) -> String {
    format!("{namespace}/{pod}/{container}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotCluster {
    pub cluster_url: String,
}

/// A stored Helm release together with the namespace its storage Secret lives in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHelmRelease {
    pub storage_namespace: String,
    #[serde(flatten)]
    pub record: HelmReleaseRecord,
}

pub fn read_json_from_dir<T>(dir: &Path, filename: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let path = dir.join(filename);
    let bytes = fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn read_list_from_dir<T>(dir: &Path, filename: &str) -> Result<Vec<Arc<T>>>
where
    T: DeserializeOwned,
{
    let items: Vec<T> = read_json_from_dir(dir, filename)?;
    Ok(items.into_iter().map(Arc::new).collect())
}

/// Like [`read_list_from_dir`], a missing file reads as an empty list.
pub fn read_optional_list_from_dir<T>(dir: &Path, filename: &str) -> Result<Vec<Arc<T>>>
where
    T: DeserializeOwned,
{
    if !dir.join(filename).exists() {
        debug!("Snapshot file {filename} not present, using an empty list");
        return Ok(Vec::new());
    }
    read_list_from_dir(dir, filename)
}

pub fn write_json_to_dir<T>(dir: &Path, filename: &str, value: &T) -> Result<PathBuf>
where
    T: Serialize,
{
    let path = dir.join(filename);
    let file = fs::File::create(&path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(path)
}

pub fn write_list_to_dir<T>(dir: &Path, filename: &str, items: &[Arc<T>]) -> Result<PathBuf>
where
    T: Serialize,
{
    let view: Vec<&T> = items.iter().map(|item| item.as_ref()).collect();
    write_json_to_dir(dir, filename, &view)
}

fn scoped<T>(
    items: &[Arc<T>],
    namespace: Option<&str>,
    namespace_of: impl Fn(&T) -> Option<&str>,
) -> Vec<Arc<T>> {
    match namespace {
        None => items.to_vec(),
        Some(ns) => items
            .iter()
            .filter(|item| namespace_of(item.as_ref()) == Some(ns))
            .cloned()
            .collect(),
    }
}

/// Serves a directory of JSON lists as if it were a cluster. Every file is optional.
pub struct SnapshotKubeClient {
    cluster: SnapshotCluster,
    default_namespace: Option<String>,
    services: Vec<Arc<Service>>,
    deployments: Vec<Arc<Deployment>>,
    pods: Vec<Arc<Pod>>,
    ingresses: Vec<Arc<Ingress>>,
    events: Vec<Arc<Event>>,
    flux_objects: HashMap<FluxResourceKind, Vec<Arc<FluxObject>>>,
    helm_history: Vec<SnapshotHelmRelease>,
    pod_logs: HashMap<String, Vec<String>>,
}

impl SnapshotKubeClient {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let cluster = if dir.join(SNAPSHOT_CLUSTER_FILE).exists() {
            read_json_from_dir(dir, SNAPSHOT_CLUSTER_FILE)?
        } else {
            SnapshotCluster::default()
        };
        let mut flux_objects = HashMap::new();
        for kind in FluxResourceKind::iter() {
            let objects = read_optional_list_from_dir(dir, &flux_snapshot_file(kind))?;
            flux_objects.insert(kind, objects);
        }
        let helm_history = if dir.join(SNAPSHOT_HELM_HISTORY_FILE).exists() {
            read_json_from_dir(dir, SNAPSHOT_HELM_HISTORY_FILE)?
        } else {
            Vec::new()
        };
        let pod_logs = if dir.join(SNAPSHOT_POD_LOGS_FILE).exists() {
            read_json_from_dir(dir, SNAPSHOT_POD_LOGS_FILE)?
        } else {
            HashMap::new()
        };
        let client = SnapshotKubeClient {
            cluster,
            default_namespace: None,
            services: read_optional_list_from_dir(dir, SNAPSHOT_SERVICES_FILE)?,
            deployments: read_optional_list_from_dir(dir, SNAPSHOT_DEPLOYMENTS_FILE)?,
            pods: read_optional_list_from_dir(dir, SNAPSHOT_PODS_FILE)?,
            ingresses: read_optional_list_from_dir(dir, SNAPSHOT_INGRESSES_FILE)?,
            events: read_optional_list_from_dir(dir, SNAPSHOT_EVENTS_FILE)?,
            flux_objects,
            helm_history,
            pod_logs,
        };
        info!(
            "Loaded snapshot from {}: {} service(s), {} deployment(s), {} pod(s), {} ingress(es), {} event(s)",
            dir.display(),
            client.services.len(),
            client.deployments.len(),
            client.pods.len(),
            client.ingresses.len(),
            client.events.len()
        );
        Ok(client)
    }

    /// Restricts `namespace: None` queries to `namespace`, like a client created for one namespace.
    pub fn with_default_namespace(mut self, namespace: Option<&str>) -> Self {
        self.default_namespace = namespace.map(str::to_string);
        self
    }

    fn scope<'a>(&'a self, namespace: Option<&'a str>) -> Option<&'a str> {
        namespace.or(self.default_namespace.as_deref())
    }
}

#[async_trait]
impl HelmHistory for SnapshotKubeClient {
    async fn history(&self, namespace: &str, release: &str) -> Result<Vec<HelmReleaseRecord>> {
        Ok(self
            .helm_history
            .iter()
            .filter(|r| r.storage_namespace == namespace && r.record.name == release)
            .map(|r| r.record.clone())
            .collect())
    }
}

#[async_trait]
impl KubeClient for SnapshotKubeClient {
    async fn get_services(&self, namespace: Option<&str>) -> Result<Vec<Arc<Service>>> {
        Ok(scoped(&self.services, self.scope(namespace), |s| s.metadata.namespace.as_deref()))
    }

    async fn get_deployments(&self, namespace: Option<&str>) -> Result<Vec<Arc<Deployment>>> {
        Ok(scoped(&self.deployments, self.scope(namespace), |d| d.metadata.namespace.as_deref()))
    }

    async fn get_pods(&self, namespace: Option<&str>) -> Result<Vec<Arc<Pod>>> {
        Ok(scoped(&self.pods, self.scope(namespace), |p| p.metadata.namespace.as_deref()))
    }

    async fn get_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Arc<Ingress>>> {
        Ok(scoped(&self.ingresses, self.scope(namespace), |i| i.metadata.namespace.as_deref()))
    }

    async fn get_events(&self, namespace: Option<&str>) -> Result<Vec<Arc<Event>>> {
        Ok(scoped(&self.events, self.scope(namespace), |e| e.metadata.namespace.as_deref()))
    }

    async fn get_flux_objects(
        &self,
        kind: FluxResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Arc<FluxObject>>> {
        let objects = self.flux_objects.get(&kind).map(Vec::as_slice).unwrap_or_default();
        Ok(scoped(objects, self.scope(namespace), |o| o.0.metadata.namespace.as_deref()))
    }

    async fn get_cluster_url(&self) -> Result<String> {
        Ok(self.cluster.cluster_url.clone())
    }

    async fn follow_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<()> {
        let key = pod_log_key(namespace, pod, container);
        let Some(recorded) = self.pod_logs.get(&key) else {
            return Err(ErrorKind::NotFound(format!("log of container {key}")).into());
        };
        for line in recorded {
            if lines.send(line.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn helm(&self) -> &dyn HelmHistory {
        self
    }
}

fn without_managed_fields<K: ResourceExt + Clone>(items: Vec<Arc<K>>) -> Vec<Arc<K>> {
    items
        .into_iter()
        .map(|item| {
            let mut item = Arc::unwrap_or_clone(item);
            item.managed_fields_mut().clear();
            Arc::new(item)
        })
        .collect()
}

/// Writes everything [`SnapshotKubeClient`] reads, as seen through `client`. Helm history is
/// exported for the releases behind the exported HelmReleases. Pod logs are not exported.
pub async fn export_snapshot_dir(
    client: &dyn KubeClient,
    dir: &Path,
    namespace: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    let cluster = SnapshotCluster {
        cluster_url: client.get_cluster_url().await?,
    };
    write_json_to_dir(dir, SNAPSHOT_CLUSTER_FILE, &cluster)?;

    let services = without_managed_fields(client.get_services(namespace).await?);
    write_list_to_dir(dir, SNAPSHOT_SERVICES_FILE, &services)?;
    let deployments = without_managed_fields(client.get_deployments(namespace).await?);
    write_list_to_dir(dir, SNAPSHOT_DEPLOYMENTS_FILE, &deployments)?;
    let pods = without_managed_fields(client.get_pods(namespace).await?);
    write_list_to_dir(dir, SNAPSHOT_PODS_FILE, &pods)?;
    let ingresses = without_managed_fields(client.get_ingresses(namespace).await?);
    write_list_to_dir(dir, SNAPSHOT_INGRESSES_FILE, &ingresses)?;
    let events = client.get_events(namespace).await?;
    write_list_to_dir(dir, SNAPSHOT_EVENTS_FILE, &events)?;

    let mut helm_history = Vec::new();
    for kind in FluxResourceKind::iter() {
        let objects = list_flux_kind(client, kind, namespace).await?;
        if kind == FluxResourceKind::HelmRelease {
            for hr in &objects {
                let target = HelmReleaseTarget::from_helm_release(hr);
                let records = client
                    .helm()
                    .history(&target.storage_namespace, &target.release_name)
                    .await?;
                helm_history.extend(records.into_iter().map(|record| SnapshotHelmRelease {
                    storage_namespace: target.storage_namespace.clone(),
                    record,
                }));
            }
        }
        write_list_to_dir(dir, &flux_snapshot_file(kind), &objects)?;
    }
    write_json_to_dir(dir, SNAPSHOT_HELM_HISTORY_FILE, &helm_history)?;

    info!(
        "Exported snapshot to {}: {} service(s), {} deployment(s), {} pod(s), {} Helm revision(s)",
        dir.display(),
        services.len(),
        deployments.len(),
        pods.len(),
        helm_history.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn service(namespace: &str, name: &str) -> Arc<Service> {
        Arc::new(Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn helm_release() -> Arc<FluxObject> {
        Arc::new(
            FluxObject::from_value(json!({
                "apiVersion": "helm.toolkit.fluxcd.io/v2",
                "kind": "HelmRelease",
                "metadata": {"name": "podinfo", "namespace": "flux-system"},
                "spec": {"targetNamespace": "apps"}
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_files_read_as_empty() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = SnapshotKubeClient::from_dir(temp.path())?;
        assert!(client.get_services(None).await?.is_empty());
        assert!(client
            .get_flux_objects(FluxResourceKind::Kustomization, None)
            .await?
            .is_empty());
        assert!(client.helm().history("flux-system", "podinfo").await?.is_empty());
        assert_eq!(client.get_cluster_url().await?, "");
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_client_filters_by_namespace() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path();
        write_json_to_dir(
            dir,
            SNAPSHOT_CLUSTER_FILE,
            &SnapshotCluster {
                cluster_url: "https://example.invalid".to_string(),
            },
        )?;
        write_list_to_dir(
            dir,
            SNAPSHOT_SERVICES_FILE,
            &[service("default", "web"), service("apps", "api")],
        )?;

        let client = SnapshotKubeClient::from_dir(dir)?;
        assert_eq!(client.get_services(None).await?.len(), 2);
        let scoped = client.get_services(Some("apps")).await?;
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].metadata.name.as_deref(), Some("api"));
        assert_eq!(client.get_cluster_url().await?, "https://example.invalid");

        let client = client.with_default_namespace(Some("default"));
        let scoped = client.get_services(None).await?;
        assert_eq!(scoped[0].metadata.name.as_deref(), Some("web"));
        assert_eq!(client.get_services(Some("apps")).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recorded_logs_are_replayed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path();
        let logs: HashMap<String, Vec<String>> = [(
            pod_log_key("default", "web-1", "app"),
            vec!["one".to_string(), "two".to_string()],
        )]
        .into();
        write_json_to_dir(dir, SNAPSHOT_POD_LOGS_FILE, &logs)?;
        let client = SnapshotKubeClient::from_dir(dir)?;

        let (tx, mut rx) = mpsc::channel(10);
        client.follow_pod_logs("default", "web-1", "app", tx).await?;
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(rx.recv().await, None);

        let (tx, _rx) = mpsc::channel(10);
        let err = client
            .follow_pod_logs("default", "web-2", "app", tx)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn export_snapshot_dir_roundtrip() -> Result<()> {
        let seed = tempfile::tempdir()?;
        let seed_dir = seed.path();
        write_list_to_dir(seed_dir, SNAPSHOT_SERVICES_FILE, &[service("apps", "podinfo")])?;
        write_list_to_dir(
            seed_dir,
            &flux_snapshot_file(FluxResourceKind::HelmRelease),
            &[helm_release()],
        )?;
        write_json_to_dir(
            seed_dir,
            SNAPSHOT_HELM_HISTORY_FILE,
            &vec![
                SnapshotHelmRelease {
                    storage_namespace: "apps".to_string(),
                    record: HelmReleaseRecord::new("apps-podinfo", "apps", 1, ""),
                },
                SnapshotHelmRelease {
                    storage_namespace: "apps".to_string(),
                    record: HelmReleaseRecord::new("other", "apps", 1, ""),
                },
            ],
        )?;
        let client = SnapshotKubeClient::from_dir(seed_dir)?;

        let out = tempfile::tempdir()?;
        export_snapshot_dir(&client, out.path(), None).await?;

        let exported = SnapshotKubeClient::from_dir(out.path())?;
        let services = exported.get_services(None).await?;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].metadata.name.as_deref(), Some("podinfo"));
        let releases = exported
            .get_flux_objects(FluxResourceKind::HelmRelease, None)
            .await?;
        assert_eq!(releases[0].name(), "podinfo");
        let history = exported.helm().history("apps", "apps-podinfo").await?;
        assert_eq!(history.len(), 1);
        assert!(exported.helm().history("apps", "other").await?.is_empty());
        Ok(())
    }
}
