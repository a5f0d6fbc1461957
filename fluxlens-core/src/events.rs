//! Flux event feed.
//!
//! Kubernetes Events about Flux objects are condensed into [`FluxEvent`]s: one per
//! (object, reason, message), newest first, each with a human-readable "last seen" text.

use crate::flux_resource::FluxResourceKind;
use crate::types::ObjectKey;
use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::core::v1::Event;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub const WARNING_EVENT_TYPE: &str = "Warning";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSeriesInfo {
    pub count: i32,
    pub last_observed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxEvent {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub reason: String,
    pub message: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub count: i32,
    pub series: Option<EventSeriesInfo>,
    #[serde(default)]
    pub last_seen_text: String,
}

fn to_utc(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

impl FluxEvent {
    /// `None` when the involved object has no kind or name.
    pub fn from_event(event: &Event) -> Option<Self> {
        let involved = &event.involved_object;
        let kind = involved.kind.clone().filter(|k| !k.is_empty())?;
        let name = involved.name.clone().filter(|n| !n.is_empty())?;
        let namespace = involved
            .namespace
            .clone()
            .or_else(|| event.metadata.namespace.clone())
            .unwrap_or_default();
        let first_seen = event
            .first_timestamp
            .as_ref()
            .and_then(|t| to_utc(t.0.as_millisecond()))
            .or_else(|| {
                event
                    .event_time
                    .as_ref()
                    .and_then(|t| to_utc(t.0.as_millisecond()))
            })
            .or_else(|| {
                event
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .and_then(|t| to_utc(t.0.as_millisecond()))
            });
        let last_seen = event
            .last_timestamp
            .as_ref()
            .and_then(|t| to_utc(t.0.as_millisecond()))
            .or(first_seen);
        let series = event.series.as_ref().map(|s| EventSeriesInfo {
            count: s.count.unwrap_or_default(),
            last_observed: s
                .last_observed_time
                .as_ref()
                .and_then(|t| to_utc(t.0.as_millisecond())),
        });
        Some(FluxEvent {
            kind,
            namespace,
            name,
            type_: event.type_.clone().unwrap_or_else(|| "Normal".to_string()),
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            first_seen,
            last_seen,
            count: event.count.unwrap_or(1),
            series,
            last_seen_text: String::new(),
        })
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_warning(&self) -> bool {
        self.type_ == WARNING_EVENT_TYPE
    }

    /// Most recent moment the event was observed.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.series
            .as_ref()
            .and_then(|s| s.last_observed)
            .or(self.last_seen)
            .or(self.first_seen)
    }

    pub fn last_seen_text(&self, now: DateTime<Utc>) -> String {
        if let Some(series) = &self.series {
            let last = series.last_observed.or(self.last_seen);
            return format!(
                "{} ago (x{} over {})",
                age(now, last),
                series.count,
                age(now, self.first_seen)
            );
        }
        if self.count > 1 {
            return format!(
                "{} ago (x{} over {})",
                age(now, self.last_seen),
                self.count,
                age(now, self.first_seen)
            );
        }
        format!("{} ago", age(now, self.first_seen))
    }
}

fn age(now: DateTime<Utc>, at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => format_duration(now - at),
        None => "unknown".to_string(),
    }
}

/// Largest whole unit: `42s`, `5m`, `3h`, `2d`. Negative spans render as `0s`.
pub fn format_duration(delta: TimeDelta) -> String {
    let secs = delta.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &FluxEvent) -> bool {
        let namespace_ok = self
            .namespace
            .as_deref()
            .is_none_or(|ns| ns == event.namespace);
        let kind_ok = self
            .kind
            .as_deref()
            .is_none_or(|kind| kind.eq_ignore_ascii_case(&event.kind));
        let name_ok = self.name.as_deref().is_none_or(|name| name == event.name);
        namespace_ok && kind_ok && name_ok
    }
}

/// Flux events only, de-duplicated by (object, reason, message) keeping the newest,
/// sorted newest first.
pub fn event_feed(events: &[Arc<Event>], filter: &EventFilter, now: DateTime<Utc>) -> Vec<FluxEvent> {
    let mut newest: HashMap<(String, String, String, String, String), FluxEvent> = HashMap::new();
    let mut total = 0usize;
    for event in events.iter().filter_map(|e| FluxEvent::from_event(e)) {
        if FluxResourceKind::parse(&event.kind).is_err() || !filter.matches(&event) {
            continue;
        }
        total += 1;
        let identity = (
            event.kind.clone(),
            event.namespace.clone(),
            event.name.clone(),
            event.reason.clone(),
            event.message.clone(),
        );
        match newest.get(&identity) {
            Some(existing) if existing.observed_at() >= event.observed_at() => {}
            _ => {
                newest.insert(identity, event);
            }
        }
    }
    let mut feed: Vec<FluxEvent> = newest.into_values().collect();
    feed.sort_by(|a, b| {
        b.observed_at()
            .cmp(&a.observed_at())
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.namespace.cmp(&b.namespace))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.reason.cmp(&b.reason))
    });
    for event in feed.iter_mut() {
        event.last_seen_text = event.last_seen_text(now);
    }
    debug!("Event feed: {} of {total} Flux event(s) after de-duplication", feed.len());
    feed
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Surfaced {
    kind: String,
    key: ObjectKey,
    reason: String,
    message: String,
    observed_at: Option<DateTime<Utc>>,
}

impl Surfaced {
    fn of(event: &FluxEvent) -> Self {
        Surfaced {
            kind: event.kind.clone(),
            key: event.object_key(),
            reason: event.reason.clone(),
            message: event.message.clone(),
            observed_at: event.observed_at(),
        }
    }
}

/// Decides which warnings deserve a notification: new since the watermark, about a
/// resource the user is looking at, and not surfaced before.
#[derive(Debug, Clone)]
pub struct NotificationTracker {
    watermark: DateTime<Utc>,
    surfaced: HashSet<Surfaced>,
}

impl NotificationTracker {
    pub fn new(since: DateTime<Utc>) -> Self {
        NotificationTracker {
            watermark: since,
            surfaced: HashSet::new(),
        }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn poll(&mut self, feed: &[FluxEvent], in_view: &HashSet<ObjectKey>) -> Vec<FluxEvent> {
        let mut fresh = Vec::new();
        let mut newest = self.watermark;
        for event in feed {
            let Some(observed_at) = event.observed_at() else {
                continue;
            };
            if observed_at < self.watermark {
                continue;
            }
            newest = newest.max(observed_at);
            if !event.is_warning() || !in_view.contains(&event.object_key()) {
                continue;
            }
            if self.surfaced.insert(Surfaced::of(event)) {
                fresh.push(event.clone());
            }
        }
        self.watermark = newest;
        let watermark = self.watermark;
        self.surfaced
            .retain(|s| s.observed_at.is_some_and(|at| at >= watermark));
        fresh
    }
}
