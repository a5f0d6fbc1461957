use crate::prelude::*;

use crate::errors::classify_kube_error;
use crate::flux_resource::{FluxObject, FluxResourceKind};
use crate::helm::{HelmHistory, SecretHelmHistory};
use crate::reconcile::FluxObjectApi;
use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DynamicObject, ListParams, LogParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Read access to the cluster. `namespace: None` means the client's default scope,
/// which is the whole cluster unless the client was created for a single namespace.
#[async_trait]
pub trait KubeClient: Sync + Send {
    async fn get_services(&self, namespace: Option<&str>) -> Result<Vec<Arc<Service>>>;
    async fn get_deployments(&self, namespace: Option<&str>) -> Result<Vec<Arc<Deployment>>>;
    async fn get_pods(&self, namespace: Option<&str>) -> Result<Vec<Arc<Pod>>>;
    async fn get_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Arc<Ingress>>>;
    async fn get_events(&self, namespace: Option<&str>) -> Result<Vec<Arc<Event>>>;
    async fn get_flux_objects(
        &self,
        kind: FluxResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Arc<FluxObject>>>;
    async fn get_cluster_url(&self) -> Result<String>;
    /// Follows the log of one container, sending every line to `lines` until the stream
    /// ends or the receiver is dropped.
    async fn follow_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<()>;
    fn helm(&self) -> &dyn HelmHistory;
}

pub struct KubeClientImpl {
    config: Config,
    client: Client,
    default_namespace: Option<String>,
    helm: SecretHelmHistory,
}

impl KubeClientImpl {
    pub async fn new(options: &KubeConfigOptions, maybe_ns: Option<&str>) -> Result<Self> {
        let cfg = match Config::from_kubeconfig(options).await {
            Ok(cfg) => {
                info!("Loaded kubeconfig using KubeConfigOptions(context: {:?}, cluster: {:?}, user: {:?}), cluster_url: {}", options.context, options.cluster, options.user, cfg.cluster_url);
                cfg
            }
            Err(err) => {
                info!("Failed to load kubeconfig using KubeConfigOptions(context: {:?}, cluster: {:?}, user: {:?}), falling back to in-cluster config. The error was: {err:?}", options.context, options.cluster, options.user);
                let in_cluster_cfg = Config::incluster()?;
                info!(
                    "Loaded in-cluster config, cluster_url: {}",
                    in_cluster_cfg.cluster_url
                );
                in_cluster_cfg
            }
        };
        let client = Client::try_from(cfg.clone())?;
        Ok(KubeClientImpl {
            config: cfg,
            helm: SecretHelmHistory::new(client.clone()),
            client,
            default_namespace: maybe_ns.map(str::to_string),
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match namespace.or(self.default_namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn flux_api(&self, kind: FluxResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace.or(self.default_namespace.as_deref()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_services(&self, namespace: Option<&str>) -> Result<Vec<Arc<Service>>> {
        get_object(&self.api(namespace)).await
    }

    async fn get_deployments(&self, namespace: Option<&str>) -> Result<Vec<Arc<Deployment>>> {
        get_object(&self.api(namespace)).await
    }

    async fn get_pods(&self, namespace: Option<&str>) -> Result<Vec<Arc<Pod>>> {
        get_object(&self.api(namespace)).await
    }

    async fn get_ingresses(&self, namespace: Option<&str>) -> Result<Vec<Arc<Ingress>>> {
        get_object(&self.api(namespace)).await
    }

    async fn get_events(&self, namespace: Option<&str>) -> Result<Vec<Arc<Event>>> {
        get_object(&self.api(namespace)).await
    }

    async fn get_flux_objects(
        &self,
        kind: FluxResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Arc<FluxObject>>> {
        let objects = get_object(&self.flux_api(kind, namespace)).await?;
        Ok(objects
            .into_iter()
            .map(|obj| Arc::new(FluxObject(Arc::unwrap_or_clone(obj))))
            .collect())
    }

    async fn get_cluster_url(&self) -> Result<String> {
        Ok(self.config.cluster_url.to_string())
    }

    async fn follow_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lines: mpsc::Sender<String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let log_params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            tail_lines: Some(LAST_N_LOG_LINES),
            timestamps: true,
            ..Default::default()
        };
        let stream = api.log_stream(pod, &log_params).await?.lines();
        futures::pin_mut!(stream);
        while let Some(line) = stream.try_next().await? {
            if lines.send(line).await.is_err() {
                debug!("Log receiver for {namespace}/{pod}/{container} went away");
                break;
            }
        }
        Ok(())
    }

    fn helm(&self) -> &dyn HelmHistory {
        &self.helm
    }
}

#[async_trait]
impl FluxObjectApi for KubeClientImpl {
    async fn get(&self, kind: FluxResourceKind, namespace: &str, name: &str) -> Result<FluxObject> {
        let api = self.flux_api(kind, Some(namespace));
        let target = format!("{kind} {namespace}/{name}");
        let obj = api
            .get(name)
            .await
            .map_err(|err| classify_kube_error(err, &target))?;
        Ok(FluxObject(obj))
    }

    async fn patch(
        &self,
        kind: FluxResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<FluxObject> {
        let api = self.flux_api(kind, Some(namespace));
        let target = format!("{kind} {namespace}/{name}");
        let obj = api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|err| classify_kube_error(err, &target))?;
        Ok(FluxObject(obj))
    }
}

const LAST_N_LOG_LINES: i64 = 100;

async fn get_object<T: Clone + DeserializeOwned + Debug>(api: &Api<T>) -> Result<Vec<Arc<T>>> {
    let mut r: Vec<Arc<T>> = Vec::new();
    let mut continue_token: Option<String> = None;
    loop {
        let lp = match continue_token {
            None => ListParams::default(),
            Some(t) => ListParams::default().continue_token(&t),
        };
        let page = api.list(&lp).await?;
        continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());

        for item in page {
            r.push(Arc::new(item))
        }
        if continue_token.is_none() {
            break;
        }
    }
    Ok(r)
}
