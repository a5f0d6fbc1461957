use crate::prelude::*;

use crate::flux_resource::{FluxObject, FluxResourceKind, FLUX_SYSTEM_NAMESPACE};
use crate::kube_client::KubeClient;
use crate::types::{FluxResourceSummary, FluxState};
use std::sync::Arc;
use tracing::{info, warn};

/// Lists every kind shown on the overview. A kind whose CRD is not installed comes back empty.
pub async fn list_flux_kind(
    client: &dyn KubeClient,
    kind: FluxResourceKind,
    namespace: Option<&str>,
) -> Result<Vec<Arc<FluxObject>>> {
    match client.get_flux_objects(kind, namespace).await {
        Ok(objects) => Ok(objects),
        Err(err) if err.is_not_found() => {
            warn!("{kind} is not served by the cluster, treating as empty");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

fn summarize(kind: FluxResourceKind, objects: &[Arc<FluxObject>]) -> Vec<FluxResourceSummary> {
    let mut summaries: Vec<FluxResourceSummary> = objects
        .iter()
        .map(|obj| FluxResourceSummary::new(kind, obj.as_ref().clone()))
        .collect();
    summaries.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    summaries
}

/// Rebuilt from scratch on every call.
pub async fn resolve_flux_state(
    client: &dyn KubeClient,
    namespace: Option<&str>,
) -> Result<FluxState> {
    let git_repositories = list_flux_kind(client, FluxResourceKind::GitRepository, namespace).await?;
    let oci_repositories = list_flux_kind(client, FluxResourceKind::OCIRepository, namespace).await?;
    let buckets = list_flux_kind(client, FluxResourceKind::Bucket, namespace).await?;
    let helm_releases = list_flux_kind(client, FluxResourceKind::HelmRelease, namespace).await?;
    let kustomizations = list_flux_kind(client, FluxResourceKind::Kustomization, namespace).await?;
    let flux_services = client
        .get_services(Some(FLUX_SYSTEM_NAMESPACE))
        .await?
        .iter()
        .map(|svc| svc.as_ref().clone())
        .collect::<Vec<_>>();

    let state = FluxState {
        git_repositories: summarize(FluxResourceKind::GitRepository, &git_repositories),
        oci_repositories: summarize(FluxResourceKind::OCIRepository, &oci_repositories),
        buckets: summarize(FluxResourceKind::Bucket, &buckets),
        helm_releases: summarize(FluxResourceKind::HelmRelease, &helm_releases),
        kustomizations: summarize(FluxResourceKind::Kustomization, &kustomizations),
        flux_services,
    };
    info!(
        "Flux state: {} git, {} oci, {} bucket, {} helm release, {} kustomization, {} flux service(s)",
        state.git_repositories.len(),
        state.oci_repositories.len(),
        state.buckets.len(),
        state.helm_releases.len(),
        state.kustomizations.len(),
        state.flux_services.len()
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::helm::{HelmHistory, HelmReleaseRecord};
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Event, Pod, Service};
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::core::Status;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Serves Kustomizations and HelmReleases, answers 404 for the source kinds and fails
    /// outright for `broken`.
    struct PartialCrdClient {
        broken: Option<FluxResourceKind>,
    }

    #[async_trait]
    impl HelmHistory for PartialCrdClient {
        async fn history(&self, _namespace: &str, _release: &str) -> Result<Vec<HelmReleaseRecord>> {
            Ok(Vec::new())
        }
    }

    fn api_error(code: u16) -> FluxLensError {
        kube::Error::Api(
            Status {
                code,
                message: format!("status {code}"),
                ..Default::default()
            }
            .into(),
        )
        .into()
    }

    #[async_trait]
    impl KubeClient for PartialCrdClient {
        async fn get_services(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Service>>> {
            Ok(Vec::new())
        }

        async fn get_deployments(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Deployment>>> {
            Ok(Vec::new())
        }

        async fn get_pods(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Pod>>> {
            Ok(Vec::new())
        }

        async fn get_ingresses(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Ingress>>> {
            Ok(Vec::new())
        }

        async fn get_events(&self, _namespace: Option<&str>) -> Result<Vec<Arc<Event>>> {
            Ok(Vec::new())
        }

        async fn get_flux_objects(
            &self,
            kind: FluxResourceKind,
            _namespace: Option<&str>,
        ) -> Result<Vec<Arc<FluxObject>>> {
            if self.broken == Some(kind) {
                return Err(api_error(500));
            }
            match kind {
                FluxResourceKind::Kustomization => Ok(vec![Arc::new(FluxObject::from_value(
                    json!({
                        "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
                        "kind": "Kustomization",
                        "metadata": {"name": "apps", "namespace": "flux-system"},
                        "spec": {"interval": "10m"}
                    }),
                )?)]),
                FluxResourceKind::HelmRelease => Ok(Vec::new()),
                _ => Err(api_error(404)),
            }
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
            self
        }
    }

    #[tokio::test]
    async fn missing_crds_list_as_empty() -> Result<()> {
        let client = PartialCrdClient { broken: None };
        assert!(list_flux_kind(&client, FluxResourceKind::Bucket, None)
            .await?
            .is_empty());

        let state = resolve_flux_state(&client, None).await?;
        assert!(state.git_repositories.is_empty());
        assert!(state.oci_repositories.is_empty());
        assert!(state.buckets.is_empty());
        assert_eq!(state.kustomizations.len(), 1);
        assert_eq!(state.kustomizations[0].name, "apps");
        Ok(())
    }

    #[tokio::test]
    async fn other_listing_failures_propagate() {
        let client = PartialCrdClient {
            broken: Some(FluxResourceKind::Kustomization),
        };
        let err = resolve_flux_state(&client, None).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::KubeClientError(_)));
        assert!(!err.is_not_found());
    }
}
