//! Builds the list of [`ManagedService`]s from one consistent-enough read of the cluster.
//!
//! Ownership comes from two independent sources, Kustomization inventories and Helm release
//! manifests. Everything else is correlated through selectors:
//! - Deployment: `spec.selector.matchLabels` equal to the Service selector
//! - Pods: labels satisfy the Service selector
//! - Ingresses: a rule path has the Service as backend

use crate::prelude::*;

use crate::flux_resource::FluxObject;
use crate::inventory::{inventory_services, resolve_helm_services, OwnedService};
use crate::kube_client::KubeClient;
use crate::selector::{selectors_equal, selects_pod, Labels};
use crate::types::{
    deployment_selector, ingress_backend_services, IngressRef, ManagedService, ObjectKey,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default)]
pub struct AggregatorOptions {
    /// Collapse a Service found through both an inventory and a Helm release into one record.
    pub merge_duplicate_sources: bool,
}

/// The Deployment whose selector equals `selector`. When several qualify, the
/// lexicographically smallest name wins.
pub fn matching_deployment<'a>(
    selector: Option<&Labels>,
    candidates: impl IntoIterator<Item = &'a Deployment>,
) -> Option<&'a Deployment> {
    let selector = selector.filter(|s| !s.is_empty())?;
    let mut matching: Vec<&Deployment> = candidates
        .into_iter()
        .filter(|d| selectors_equal(Some(selector), deployment_selector(d)))
        .collect();
    matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    if matching.len() > 1 {
        let names: Vec<&str> = matching
            .iter()
            .filter_map(|d| d.metadata.name.as_deref())
            .collect();
        warn!(
            "Several Deployments match selector {selector:?}: {names:?}, using `{}`",
            names.first().copied().unwrap_or_default()
        );
    }
    matching.into_iter().next()
}

/// Pods in `namespace` selected by `selector`, ordered by name.
pub fn matching_pods<'a>(
    namespace: &str,
    selector: Option<&Labels>,
    candidates: impl IntoIterator<Item = &'a Pod>,
) -> Vec<Pod> {
    let mut pods: Vec<Pod> = candidates
        .into_iter()
        .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
        .filter(|pod| selects_pod(selector, pod))
        .cloned()
        .collect();
    pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    pods.dedup_by(|a, b| a.metadata.name == b.metadata.name);
    pods
}

/// Ingresses in `namespace` routing to the Service `service_name`, ordered by name.
pub fn matching_ingresses<'a>(
    namespace: &str,
    service_name: &str,
    candidates: impl IntoIterator<Item = &'a Ingress>,
) -> Vec<IngressRef> {
    let mut ingresses: Vec<IngressRef> = candidates
        .into_iter()
        .filter(|ing| ing.metadata.namespace.as_deref() == Some(namespace))
        .filter(|ing| ingress_backend_services(ing).contains(service_name))
        .filter_map(IngressRef::from_ingress)
        .collect();
    ingresses.sort_by(|a, b| a.name.cmp(&b.name));
    ingresses.dedup_by(|a, b| a.name == b.name);
    ingresses
}

pub struct ServiceAggregator<'a> {
    client: &'a dyn KubeClient,
    options: AggregatorOptions,
}

impl<'a> ServiceAggregator<'a> {
    pub fn new(client: &'a dyn KubeClient, options: AggregatorOptions) -> Self {
        ServiceAggregator { client, options }
    }

    /// Identities of every owned Service, inventory sources first.
    pub async fn resolve_owned(
        &self,
        kustomizations: &[Arc<FluxObject>],
        helm_releases: &[Arc<FluxObject>],
    ) -> Result<Vec<OwnedService>> {
        let from_inventory: Vec<OwnedService> = kustomizations
            .iter()
            .flat_map(|ks| inventory_services(ks))
            .collect();
        let helm_releases: Vec<FluxObject> =
            helm_releases.iter().map(|hr| hr.as_ref().clone()).collect();
        let from_helm = resolve_helm_services(self.client.helm(), &helm_releases).await?;
        debug!(
            "Resolved {} inventory and {} Helm service reference(s)",
            from_inventory.len(),
            from_helm.len()
        );
        Ok(combine_sources(
            from_inventory,
            from_helm,
            self.options.merge_duplicate_sources,
        ))
    }

    /// Fails on the first listing error, there is no partial result.
    pub async fn aggregate(
        &self,
        kustomizations: &[Arc<FluxObject>],
        helm_releases: &[Arc<FluxObject>],
    ) -> Result<Vec<ManagedService>> {
        let owned = self.resolve_owned(kustomizations, helm_releases).await?;
        let namespaces: BTreeSet<&str> = owned.iter().map(|o| o.key.namespace.as_str()).collect();

        let mut services_by_key: HashMap<ObjectKey, Arc<Service>> = HashMap::new();
        for ns in &namespaces {
            for service in self.client.get_services(Some(ns)).await? {
                if let Some(key) = ObjectKey::from_meta(&service.metadata) {
                    services_by_key.insert(key, service);
                }
            }
        }

        let mut records: Vec<ManagedService> = Vec::with_capacity(owned.len());
        for owned_service in &owned {
            match services_by_key.get(&owned_service.key) {
                Some(service) => records.push(ManagedService::new(
                    service.as_ref().clone(),
                    owned_service.helm_release.clone(),
                )),
                None => debug!(
                    "Service {} is owned but does not exist in the cluster",
                    owned_service.key
                ),
            }
        }

        let resolved_namespaces: BTreeSet<String> =
            records.iter().map(|r| r.namespace().to_string()).collect();
        let mut deployments: HashMap<String, Vec<Arc<Deployment>>> = HashMap::new();
        let mut ingresses: HashMap<String, Vec<Arc<Ingress>>> = HashMap::new();
        for ns in &resolved_namespaces {
            deployments.insert(ns.clone(), self.client.get_deployments(Some(ns)).await?);
            ingresses.insert(ns.clone(), self.client.get_ingresses(Some(ns)).await?);
        }
        let pods = if records.is_empty() {
            Vec::new()
        } else {
            self.client.get_pods(None).await?
        };

        for record in records.iter_mut() {
            let ns = record.namespace().to_string();
            let selector = record.selector().cloned();
            let ns_deployments = deployments.get(&ns).map(Vec::as_slice).unwrap_or_default();
            record.deployment =
                matching_deployment(selector.as_ref(), ns_deployments.iter().map(AsRef::as_ref))
                    .cloned();
            record.pods = matching_pods(&ns, selector.as_ref(), pods.iter().map(AsRef::as_ref));
            let ns_ingresses = ingresses.get(&ns).map(Vec::as_slice).unwrap_or_default();
            record.ingresses = matching_ingresses(
                &ns,
                record.name(),
                ns_ingresses.iter().map(AsRef::as_ref),
            );
        }

        info!(
            "Aggregated {} managed service(s) across {} namespace(s)",
            records.len(),
            resolved_namespaces.len()
        );
        Ok(records)
    }
}

/// Without merging, a Service listed by both sources yields two records. Exact repeats
/// within one source are dropped either way.
fn combine_sources(
    from_inventory: Vec<OwnedService>,
    from_helm: Vec<OwnedService>,
    merge: bool,
) -> Vec<OwnedService> {
    let mut seen: HashSet<OwnedService> = HashSet::new();
    let mut combined: Vec<OwnedService> = Vec::new();
    for owned in from_inventory.into_iter().chain(from_helm) {
        if merge {
            if let Some(existing) = combined.iter_mut().find(|o| o.key == owned.key) {
                if existing.helm_release.is_none() {
                    existing.helm_release = owned.helm_release;
                }
                continue;
            }
        }
        if seen.insert(owned.clone()) {
            combined.push(owned);
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helm::{HelmHistory, HelmReleaseRecord};
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Event, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use crate::flux_resource::FluxResourceKind;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn meta(ns: &str, name: &str, labels: Option<Labels>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels,
            ..Default::default()
        }
    }

    fn service(ns: &str, name: &str, selector: &[(&str, &str)]) -> Arc<Service> {
        Arc::new(Service {
            metadata: meta(ns, name, None),
            spec: Some(ServiceSpec {
                selector: Some(labels(selector)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn deployment(ns: &str, name: &str, selector: &[(&str, &str)]) -> Arc<Deployment> {
        Arc::new(Deployment {
            metadata: meta(ns, name, None),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(labels(selector)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn pod(ns: &str, name: &str, pod_labels: &[(&str, &str)]) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: meta(ns, name, Some(labels(pod_labels))),
            ..Default::default()
        })
    }

    fn kustomization(ids: &[&str]) -> Arc<FluxObject> {
        let entries: Vec<_> = ids.iter().map(|id| json!({"id": id, "v": "v1"})).collect();
        Arc::new(
            FluxObject::from_value(json!({
                "metadata": {"name": "apps", "namespace": "flux-system"},
                "status": {"inventory": {"entries": entries}}
            }))
            .unwrap(),
        )
    }

    #[derive(Default)]
    struct TestClient {
        services: Vec<Arc<Service>>,
        deployments: Vec<Arc<Deployment>>,
        pods: Vec<Arc<Pod>>,
        ingresses: Vec<Arc<Ingress>>,
        helm: TestHelm,
        fail_pods: bool,
    }

    #[derive(Default)]
    struct TestHelm {
        records: Vec<HelmReleaseRecord>,
    }

    #[async_trait]
    impl HelmHistory for TestHelm {
        async fn history(&self, namespace: &str, release: &str) -> Result<Vec<HelmReleaseRecord>> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.namespace == namespace && r.name == release)
                .cloned()
                .collect())
        }
    }

    fn in_ns<T: kube::Resource>(items: &[Arc<T>], ns: Option<&str>) -> Vec<Arc<T>> {
        items
            .iter()
            .filter(|i| ns.is_none() || i.meta().namespace.as_deref() == ns)
            .cloned()
            .collect()
    }

    #[async_trait]
    impl KubeClient for TestClient {
        async fn get_services(&self, namespace: Option<&str>) -> Result<Vec<Arc<Service>>> {
            Ok(in_ns(&self.services, namespace))
        }

        async fn get_deployments(&self, namespace: Option<&str>) -> Result<Vec<Arc<Deployment>>> {
            Ok(in_ns(&self.deployments, namespace))
        }

        async fn get_pods(&self, namespace: Option<&str>) -> Result<Vec<Arc<Pod>>> {
            if self.fail_pods {
                return Err(std::io::Error::other("connection reset").into());
            }
            Ok(in_ns(&self.pods, namespace))
        }

        async fn get_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Arc<Ingress>>> {
            Ok(in_ns(&self.ingresses, namespace))
        }

        async fn get_events(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Event>>> {
            Ok(Vec::new())
        }

        async fn get_flux_objects(
            &self,
            _kind: FluxResourceKind,
            _namespace: Option<&str>,
        ) -> Result<Vec<Arc<FluxObject>>> {
            Ok(Vec::new())
        }

        async fn get_cluster_url(&self) -> Result<String> {
            Ok("https://example.invalid".to_string())
        }

        async fn follow_pod_logs(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _lines: mpsc::Sender<String>,
        ) -> Result<()> {
            Ok(())
        }

        fn helm(&self) -> &dyn HelmHistory {
            &self.helm
        }
    }

    #[tokio::test]
    async fn correlates_deployment_and_pods() -> Result<()> {
        let client = TestClient {
            services: vec![
                service("default", "web", &[("app", "web")]),
                service("default", "unowned", &[("app", "web")]),
            ],
            deployments: vec![
                deployment("default", "web", &[("app", "web")]),
                deployment("default", "api", &[("app", "api")]),
            ],
            pods: vec![
                pod("default", "web-2", &[("app", "web"), ("pod-template-hash", "x")]),
                pod("default", "web-1", &[("app", "web")]),
                pod("default", "api-1", &[("app", "api")]),
                pod("other", "web-1", &[("app", "web")]),
            ],
            ..Default::default()
        };
        let aggregator = ServiceAggregator::new(&client, AggregatorOptions::default());
        let records = aggregator
            .aggregate(&[kustomization(&["default_web__Service"])], &[])
            .await?;

        assert_eq!(records.len(), 1);
        let web = &records[0];
        assert_eq!(web.name(), "web");
        assert_eq!(
            web.deployment_key(),
            Some(ObjectKey::new("default", "web"))
        );
        let pod_names: Vec<_> = web
            .pods
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        assert_eq!(pod_names, vec!["web-1", "web-2"]);
        assert_eq!(web.helm_release, None);
        Ok(())
    }

    #[tokio::test]
    async fn smallest_deployment_name_wins() -> Result<()> {
        let client = TestClient {
            services: vec![service("default", "web", &[("app", "web")])],
            deployments: vec![
                deployment("default", "web-b", &[("app", "web")]),
                deployment("default", "web-a", &[("app", "web")]),
            ],
            ..Default::default()
        };
        let aggregator = ServiceAggregator::new(&client, AggregatorOptions::default());
        let records = aggregator
            .aggregate(&[kustomization(&["default_web__Service"])], &[])
            .await?;
        assert_eq!(
            records[0].deployment_key(),
            Some(ObjectKey::new("default", "web-a"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_selector_selects_nothing() -> Result<()> {
        let client = TestClient {
            services: vec![service("default", "headless", &[])],
            deployments: vec![deployment("default", "any", &[])],
            pods: vec![pod("default", "p", &[("app", "web")])],
            ..Default::default()
        };
        let aggregator = ServiceAggregator::new(&client, AggregatorOptions::default());
        let records = aggregator
            .aggregate(&[kustomization(&["default_headless__Service"])], &[])
            .await?;
        assert_eq!(records.len(), 1);
        assert!(records[0].pods.is_empty());
        assert!(records[0].deployment.is_none());
        Ok(())
    }

    fn both_sources_client() -> TestClient {
        TestClient {
            services: vec![service("default", "web", &[("app", "web")])],
            helm: TestHelm {
                records: vec![HelmReleaseRecord::new(
                    "web",
                    "default",
                    1,
                    "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
                )],
            },
            ..Default::default()
        }
    }

    fn helm_release() -> Arc<FluxObject> {
        Arc::new(
            FluxObject::from_value(json!({"metadata": {"name": "web", "namespace": "default"}}))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn duplicate_sources_are_kept_by_default() -> Result<()> {
        let client = both_sources_client();
        let aggregator = ServiceAggregator::new(&client, AggregatorOptions::default());
        let records = aggregator
            .aggregate(&[kustomization(&["default_web__Service"])], &[helm_release()])
            .await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].helm_release, None);
        assert_eq!(records[1].helm_release.as_deref(), Some("web"));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_sources_merge_keeps_helm_tag() -> Result<()> {
        let client = both_sources_client();
        let options = AggregatorOptions {
            merge_duplicate_sources: true,
        };
        let aggregator = ServiceAggregator::new(&client, options);
        let records = aggregator
            .aggregate(&[kustomization(&["default_web__Service"])], &[helm_release()])
            .await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].helm_release.as_deref(), Some("web"));
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_aborts() {
        let client = TestClient {
            services: vec![service("default", "web", &[("app", "web")])],
            fail_pods: true,
            ..Default::default()
        };
        let aggregator = ServiceAggregator::new(&client, AggregatorOptions::default());
        let result = aggregator
            .aggregate(&[kustomization(&["default_web__Service"])], &[])
            .await;
        assert!(result.is_err());
    }
}
