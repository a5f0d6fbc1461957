use crate::errors::{AppError, ErrorKind, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use fluxlens_core::events::{event_feed, EventFilter, FluxEvent, NotificationTracker};
use fluxlens_core::flux_resource::FluxResourceKind;
use fluxlens_core::flux_state::resolve_flux_state;
use fluxlens_core::kube_client::KubeClient;
use fluxlens_core::logs::{LogRegistry, LogStreamKey};
use fluxlens_core::reconcile::{ActionOutcome, FluxAction, Orchestrator};
use fluxlens_core::store::actor::StoreHandle;
use fluxlens_core::store::ServiceSnapshot;
use fluxlens_core::types::{FluxState, ObjectKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn KubeClient>,
    pub namespace: Option<String>,
    pub store: StoreHandle,
    /// `None` when serving a snapshot, actions are rejected then.
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub logs: Arc<LogRegistry>,
    pub notifications: Arc<Mutex<NotificationTracker>>,
}

pub fn create_route(state: AppState) -> Router {
    let api_route = Router::new()
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/services", get(get_services))
        .route("/api/v1/events", get(get_events))
        .route("/api/v1/notifications", post(poll_notifications))
        .route(
            "/api/v1/resources/{kind}/{namespace}/{name}/{action}",
            post(run_action),
        )
        .route("/api/v1/logs", get(list_logs).delete(stop_all_logs))
        .route(
            "/api/v1/logs/{namespace}/{pod}/{container}",
            get(get_logs).post(start_logs).delete(stop_logs),
        )
        .with_state(state);
    Router::new().merge(api_route)
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_state(State(state): State<AppState>) -> Result<Json<FluxState>> {
    let flux_state = resolve_flux_state(state.client.as_ref(), state.namespace.as_deref()).await?;
    Ok(Json(flux_state))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_services(State(state): State<AppState>) -> Json<ServiceSnapshot> {
    Json(state.store.snapshot())
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<Vec<FluxEvent>>> {
    let namespace = filter.namespace.as_deref().or(state.namespace.as_deref());
    let events = state.client.get_events(namespace).await?;
    Ok(Json(event_feed(&events, &filter, Utc::now())))
}

#[derive(Deserialize, Debug, Default)]
pub struct NotificationRequest {
    #[serde(default)]
    pub resources: Vec<ObjectKey>,
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn poll_notifications(
    State(state): State<AppState>,
    Json(request): Json<NotificationRequest>,
) -> Result<Json<Vec<FluxEvent>>> {
    let events = state.client.get_events(state.namespace.as_deref()).await?;
    let feed = event_feed(&events, &EventFilter::default(), Utc::now());
    let in_view: HashSet<ObjectKey> = request.resources.into_iter().collect();
    let fresh = state
        .notifications
        .lock()
        .expect("Failed to lock notification tracker")
        .poll(&feed, &in_view);
    Ok(Json(fresh))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn run_action(
    State(state): State<AppState>,
    Path((kind, namespace, name, action)): Path<(String, String, String, String)>,
) -> Result<Json<ActionOutcome>> {
    let kind = FluxResourceKind::parse(&kind)?;
    let action =
        FluxAction::from_str(&action).map_err(|_| ErrorKind::InvalidAction(action.clone()))?;
    let Some(orchestrator) = state.orchestrator.as_ref() else {
        return Err(ErrorKind::ReadOnly(format!(
            "cannot {action} {kind} {namespace}/{name} while serving a snapshot"
        ))
        .into());
    };
    let outcome = orchestrator.run(action, kind, &namespace, &name).await?;
    Ok(Json(outcome))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn list_logs(State(state): State<AppState>) -> Json<Vec<LogStreamKey>> {
    Json(state.logs.active())
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn start_logs(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
) -> StatusCode {
    state
        .logs
        .start(LogStreamKey::new(namespace, pod, container));
    StatusCode::ACCEPTED
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_logs(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
) -> Result<Json<Vec<String>>> {
    let key = LogStreamKey::new(namespace, pod, container);
    state
        .logs
        .lines(&key)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("log stream {key}")))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn stop_logs(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    let key = LogStreamKey::new(namespace, pod, container);
    if state.logs.stop(&key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("log stream {key}")))
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StoppedStreams {
    pub stopped: usize,
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn stop_all_logs(State(state): State<AppState>) -> Json<StoppedStreams> {
    Json(StoppedStreams {
        stopped: state.logs.stop_all(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use fluxlens_core::snapshot::{
        pod_log_key, write_json_to_dir, SnapshotKubeClient, SNAPSHOT_EVENTS_FILE,
        SNAPSHOT_POD_LOGS_FILE,
    };
    use fluxlens_core::store::ServiceStore;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn warning(name: &str, reason: &str) -> serde_json::Value {
        let stamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {"name": format!("{name}.{reason}"), "namespace": "flux-system"},
            "involvedObject": {"kind": "Kustomization", "name": name, "namespace": "flux-system"},
            "reason": reason,
            "message": format!("{reason} for {name}"),
            "type": "Warning",
            "firstTimestamp": stamp,
            "lastTimestamp": stamp,
            "count": 1
        })
    }

    fn app(temp: &tempfile::TempDir) -> Router {
        write_json_to_dir(
            temp.path(),
            SNAPSHOT_EVENTS_FILE,
            &vec![
                warning("apps", "ReconciliationFailed"),
                warning("infra", "ArtifactFailed"),
            ],
        )
        .unwrap();
        let logs: HashMap<String, Vec<String>> =
            [(pod_log_key("default", "web-1", "app"), vec!["hello".to_string()])].into();
        write_json_to_dir(temp.path(), SNAPSHOT_POD_LOGS_FILE, &logs).unwrap();

        let client: Arc<dyn KubeClient> = Arc::new(SnapshotKubeClient::from_dir(temp.path()).unwrap());
        let state = AppState {
            logs: Arc::new(LogRegistry::new(client.clone())),
            client,
            namespace: None,
            store: StoreHandle::spawn("services", ServiceStore::new()),
            orchestrator: None,
            notifications: Arc::new(Mutex::new(NotificationTracker::new(
                Utc::now() - chrono::TimeDelta::minutes(5),
            ))),
        };
        create_route(state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn events_are_filtered_by_name() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(&temp);
        let (status, body) = call(&app, Method::GET, "/api/v1/events?name=infra", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let feed: Vec<FluxEvent> = parse(&body);
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].reason, "ArtifactFailed");
    }

    #[tokio::test]
    async fn notifications_surface_once() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(&temp);
        let request = json!({"resources": [{"namespace": "flux-system", "name": "apps"}]});
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/notifications",
            Body::from(request.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let fresh: Vec<FluxEvent> = parse(&body);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].name, "apps");

        let (_, body) = call(
            &app,
            Method::POST,
            "/api/v1/notifications",
            Body::from(request.to_string()),
        )
        .await;
        assert!(parse::<Vec<FluxEvent>>(&body).is_empty());
    }

    #[tokio::test]
    async fn actions_are_rejected_for_snapshots() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(&temp);
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/resources/kustomization/flux-system/apps/reconcile",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(parse::<ErrorCode>(&body).code, 50101);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/resources/widget/flux-system/apps/reconcile",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse::<ErrorCode>(&body).code, 40001);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/resources/kustomization/flux-system/apps/explode",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse::<ErrorCode>(&body).code, 40002);
    }

    #[tokio::test]
    async fn log_stream_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(&temp);
        let uri = "/api/v1/logs/default/web-1/app";

        let (status, _) = call(&app, Method::GET, uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::POST, uri, Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The recorded log is finite, so the stream ends and deregisters itself.
        let (status, body) = call(&app, Method::GET, "/api/v1/logs", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(parse::<Vec<LogStreamKey>>(&body).is_empty());

        let (status, _) = call(&app, Method::DELETE, uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::DELETE, "/api/v1/logs", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<StoppedStreams>(&body).stopped, 0);
    }

    #[tokio::test]
    async fn services_and_state_from_empty_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(&temp);
        let (status, body) = call(&app, Method::GET, "/api/v1/services", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");

        let (status, body) = call(&app, Method::GET, "/api/v1/state", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let state: FluxState = parse(&body);
        assert!(state.kustomizations.is_empty());
    }
}
