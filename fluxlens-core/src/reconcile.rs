//! Reconcile, suspend and resume of Flux objects.
//!
//! Every action patches the object and then, except for suspend, polls it until the
//! controller reports readiness, a terminal failure, or the deadline passes:
//!
//! `Requested -> Patched -> Polling -> Succeeded | Failed | TimedOut`

use crate::prelude::*;

use crate::errors::ErrorKind;
use crate::flux_resource::{
    FluxObject, FluxResourceKind, Readiness, RECONCILE_FORCE_AT_ANNOTATION,
    RECONCILE_REQUESTED_AT_ANNOTATION,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Ready=False reasons that mean "still working on it".
pub const IN_PROGRESS_REASONS: [&str; 3] =
    ["Progressing", "DependencyNotReady", "ProgressingWithRetry"];

/// Get and merge-patch for any Flux kind.
#[async_trait]
pub trait FluxObjectApi: Sync + Send {
    /// Fails with `NotFound` when the object does not exist.
    async fn get(&self, kind: FluxResourceKind, namespace: &str, name: &str) -> Result<FluxObject>;
    /// JSON merge patch. A stale `metadata.resourceVersion` fails with `Conflict`.
    async fn patch(
        &self,
        kind: FluxResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<FluxObject>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum FluxAction {
    Reconcile,
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum OperationPhase {
    Requested,
    Patched,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub conflict_attempts: u32,
    pub conflict_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5 * 60),
            conflict_attempts: 5,
            conflict_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub kind: FluxResourceKind,
    pub namespace: String,
    pub name: String,
    pub action: FluxAction,
    pub phase: OperationPhase,
    pub message: String,
}

enum Assessment {
    Ready,
    Pending,
    Failed(String),
}

/// Drives one action to completion. Dropping the returned future abandons the polling.
pub struct Orchestrator {
    api: Arc<dyn FluxObjectApi>,
    config: OrchestratorConfig,
}

struct Operation<'a> {
    kind: FluxResourceKind,
    namespace: &'a str,
    name: &'a str,
    action: FluxAction,
    phase: OperationPhase,
}

impl Operation<'_> {
    fn advance(&mut self, phase: OperationPhase) {
        debug!(
            "{} {} {}/{}: {} -> {phase}",
            self.action, self.kind, self.namespace, self.name, self.phase
        );
        self.phase = phase;
    }

    fn target(&self) -> String {
        format!("{} {}/{}", self.kind, self.namespace, self.name)
    }

    fn outcome(&self, message: String) -> ActionOutcome {
        ActionOutcome {
            kind: self.kind,
            namespace: self.namespace.to_string(),
            name: self.name.to_string(),
            action: self.action,
            phase: self.phase,
            message,
        }
    }
}

impl Orchestrator {
    pub fn new(api: Arc<dyn FluxObjectApi>, config: OrchestratorConfig) -> Self {
        Orchestrator { api, config }
    }

    pub async fn run(
        &self,
        action: FluxAction,
        kind: FluxResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ActionOutcome> {
        let mut op = Operation {
            kind,
            namespace,
            name,
            action,
            phase: OperationPhase::Requested,
        };
        info!("{action} requested for {}", op.target());
        if action == FluxAction::Reconcile && !kind.is_reconcilable() {
            return Err(ErrorKind::InvalidState(format!(
                "{kind} cannot be reconciled on demand"
            ))
            .into());
        }

        let (patched, handled_before) = self.patch_with_retry(&op).await?;
        op.advance(OperationPhase::Patched);

        if action == FluxAction::Suspend {
            op.advance(OperationPhase::Succeeded);
            return Ok(op.outcome(format!("{} suspended", op.target())));
        }
        if kind.readiness() == Readiness::Static {
            op.advance(OperationPhase::Succeeded);
            return Ok(op.outcome(kind.success_message(&patched)));
        }

        op.advance(OperationPhase::Polling);
        self.poll(&mut op, handled_before.as_deref()).await
    }

    /// Returns the patched object and the pre-patch `lastHandledReconcileAt`.
    async fn patch_with_retry(&self, op: &Operation<'_>) -> Result<(FluxObject, Option<String>)> {
        let mut attempt = 0;
        loop {
            let current = self.api.get(op.kind, op.namespace, op.name).await?;
            if op.action == FluxAction::Reconcile && current.is_suspended() {
                return Err(ErrorKind::AlreadySuspended(op.target()).into());
            }
            let handled_before = current.last_handled_reconcile_at().map(str::to_string);
            let patch = build_patch(op.action, op.kind, &current, &requested_at());
            match self.api.patch(op.kind, op.namespace, op.name, &patch).await {
                Ok(patched) => return Ok((patched, handled_before)),
                Err(err) if err.is_conflict() && attempt + 1 < self.config.conflict_attempts => {
                    let backoff = self.config.conflict_backoff * 2u32.pow(attempt);
                    warn!(
                        "Conflict patching {} (attempt {}), retrying in {backoff:?}",
                        op.target(),
                        attempt + 1
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn poll(&self, op: &mut Operation<'_>, handled_before: Option<&str>) -> Result<ActionOutcome> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                op.advance(OperationPhase::TimedOut);
                warn!("Gave up waiting for {}", op.target());
                return Err(ErrorKind::Timeout(op.target()).into());
            }
            sleep(self.config.poll_interval.min(remaining)).await;

            let obj = match self.api.get(op.kind, op.namespace, op.name).await {
                Ok(obj) => obj,
                Err(err) => {
                    warn!("Polling {} failed, will retry: {err}", op.target());
                    continue;
                }
            };
            match assess(op.action, &obj, handled_before) {
                Assessment::Ready => {
                    op.advance(OperationPhase::Succeeded);
                    let message = op.kind.success_message(&obj);
                    info!("{} {}: {message}", op.action, op.target());
                    return Ok(op.outcome(message));
                }
                Assessment::Failed(message) => {
                    op.advance(OperationPhase::Failed);
                    return Err(ErrorKind::ReadinessFailed(message).into());
                }
                Assessment::Pending => {}
            }
        }
    }
}

fn assess(action: FluxAction, obj: &FluxObject, handled_before: Option<&str>) -> Assessment {
    if action == FluxAction::Reconcile && obj.last_handled_reconcile_at() == handled_before {
        return Assessment::Pending;
    }
    let Some(ready) = obj.ready_condition() else {
        return Assessment::Pending;
    };
    if !obj.is_observed() {
        return Assessment::Pending;
    }
    if ready.is_true() {
        return Assessment::Ready;
    }
    let in_progress = ready
        .reason
        .as_deref()
        .is_some_and(|reason| IN_PROGRESS_REASONS.contains(&reason));
    if ready.status == "False" && !in_progress {
        return Assessment::Failed(
            ready
                .message
                .unwrap_or_else(|| ready.reason.unwrap_or_else(|| "not ready".to_string())),
        );
    }
    Assessment::Pending
}

fn requested_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Merge patch for `action`, pinned to the resource version that was read.
pub fn build_patch(
    action: FluxAction,
    kind: FluxResourceKind,
    current: &FluxObject,
    requested_at: &str,
) -> Value {
    let mut metadata = Map::new();
    if let Some(rv) = current.resource_version() {
        metadata.insert("resourceVersion".to_string(), json!(rv));
    }
    let mut annotations = Map::new();
    let mut patch = Map::new();
    match action {
        FluxAction::Suspend => {
            patch.insert("spec".to_string(), json!({"suspend": true}));
        }
        FluxAction::Resume => {
            patch.insert("spec".to_string(), json!({"suspend": false}));
            annotations.insert(
                RECONCILE_REQUESTED_AT_ANNOTATION.to_string(),
                json!(requested_at),
            );
        }
        FluxAction::Reconcile => {
            annotations.insert(
                RECONCILE_REQUESTED_AT_ANNOTATION.to_string(),
                json!(requested_at),
            );
            if kind == FluxResourceKind::HelmRelease {
                annotations.insert(
                    RECONCILE_FORCE_AT_ANNOTATION.to_string(),
                    json!(requested_at),
                );
            }
        }
    }
    if !annotations.is_empty() {
        metadata.insert("annotations".to_string(), Value::Object(annotations));
    }
    patch.insert("metadata".to_string(), Value::Object(metadata));
    Value::Object(patch)
}
