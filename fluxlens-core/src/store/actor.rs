use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::prelude::*;
use crate::store::{ServiceSnapshot, ServiceStore, StoreEvent};
use crate::types::ManagedService;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 1024;

enum Command {
    Apply(StoreEvent),
    Replace {
        services: Vec<ManagedService>,
        resp: oneshot::Sender<()>,
    },
    Sync {
        resp: oneshot::Sender<()>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to the task that owns the [`ServiceStore`]. Every clone talks to the same task,
/// which applies events strictly in the order it receives them.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ServiceSnapshot>,
    label: &'static str,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Apply(event) => write!(f, "Apply({event})"),
            Command::Replace { services, .. } => write!(f, "Replace({})", services.len()),
            Command::Sync { .. } => write!(f, "Sync"),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl StoreHandle {
    pub fn spawn(label: &'static str, initial: ServiceStore) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let (snapshot_tx, snapshots) = watch::channel(initial.snapshot());

        tokio::spawn(async move {
            let mut store = initial;
            info!("{label}: store started with {} service(s)", store.len());
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Apply(event) => {
                        let before = store.snapshot();
                        if let Err(err) = store.apply(event) {
                            warn!("{label}: dropping event: {err}");
                            continue;
                        }
                        let after = store.snapshot();
                        if !std::sync::Arc::ptr_eq(&before, &after) {
                            snapshot_tx.send_replace(after);
                        }
                    }
                    Command::Replace { services, resp } => {
                        info!("{label}: replacing store with {} service(s)", services.len());
                        store = ServiceStore::seeded(services);
                        snapshot_tx.send_replace(store.snapshot());
                        let _ = resp.send(());
                    }
                    Command::Sync { resp } => {
                        let _ = resp.send(());
                    }
                    Command::Shutdown { resp } => {
                        let _ = resp.send(());
                        break;
                    }
                }
            }
            debug!("{label}: store stopped");
        });

        Self {
            tx,
            snapshots,
            label,
        }
    }

    /// Queues an event. Fails only when the store task is gone.
    pub async fn send(&self, event: StoreEvent) -> Result<()> {
        self.tx.send(Command::Apply(event)).await.map_err(|e| {
            std::io::Error::other(format!(
                "{label} store is not available: {e}",
                label = self.label
            ))
            .into()
        })
    }

    /// Swaps in a fresh aggregation result, dropping everything observed so far.
    pub async fn replace(&self, services: Vec<ManagedService>) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request(Command::Replace {
            services,
            resp: resp_tx,
        })
        .await?;
        self.wait(resp_rx).await
    }

    /// Resolves once every event queued before the call has been applied.
    pub async fn sync(&self) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request(Command::Sync { resp: resp_tx }).await?;
        self.wait(resp_rx).await
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceSnapshot> {
        self.snapshots.clone()
    }

    pub async fn shutdown(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { resp: resp_tx }).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(5), resp_rx).await;
        }
    }

    async fn request(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|e| {
            std::io::Error::other(format!(
                "{label} store is not available: {e}",
                label = self.label
            ))
            .into()
        })
    }

    async fn wait(&self, resp_rx: oneshot::Receiver<()>) -> Result<()> {
        resp_rx.await.map_err(|e| {
            std::io::Error::other(format!(
                "{label} store response dropped: {e}",
                label = self.label
            ))
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WatchEvent;
    use crate::types::ObjectKey;
    use k8s_openapi::api::core::v1::{Pod, Service, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn web_service() -> Service {
        Service {
            metadata: meta("web", &[]),
            spec: Some(ServiceSpec {
                selector: Some([("app".to_string(), "web".to_string())].into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn applies_events_in_order_and_publishes_snapshots() -> Result<()> {
        let handle = StoreHandle::spawn("test", ServiceStore::new());
        let mut updates = handle.subscribe();

        handle
            .send(StoreEvent::Service(WatchEvent::Created(web_service())))
            .await?;
        handle
            .send(StoreEvent::Pod(WatchEvent::Created(Pod {
                metadata: meta("web-1", &[("app", "web")]),
                ..Default::default()
            })))
            .await?;
        handle.sync().await?;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].pods.len(), 1);
        assert!(updates.has_changed().unwrap_or(false));
        updates.mark_unchanged();

        handle
            .send(StoreEvent::Pod(WatchEvent::Deleted(ObjectKey::new(
                "default", "web-1",
            ))))
            .await?;
        handle.sync().await?;
        assert!(handle.snapshot()[0].pods.is_empty());
        assert_eq!(snapshot[0].pods.len(), 1);

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_events_do_not_stop_the_store() -> Result<()> {
        let handle = StoreHandle::spawn("test", ServiceStore::new());
        let mut nameless = web_service();
        nameless.metadata.name = None;
        handle
            .send(StoreEvent::Service(WatchEvent::Created(nameless)))
            .await?;
        handle
            .send(StoreEvent::Service(WatchEvent::Created(web_service())))
            .await?;
        handle.sync().await?;
        assert_eq!(handle.snapshot().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn replace_resets_contents() -> Result<()> {
        let handle = StoreHandle::spawn("test", ServiceStore::new());
        handle
            .send(StoreEvent::Service(WatchEvent::Created(web_service())))
            .await?;
        handle.replace(Vec::new()).await?;
        assert!(handle.snapshot().is_empty());
        Ok(())
    }
}
