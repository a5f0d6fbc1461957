use crate::kube_client::KubeClient;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_LOG_BUFFER_LINES: usize = 1000;
const LINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogStreamKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl LogStreamKey {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        LogStreamKey {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for LogStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

type LineBuffer = Arc<Mutex<VecDeque<String>>>;

struct LogStream {
    id: u64,
    token: CancellationToken,
    lines: LineBuffer,
}

/// Running log streams, at most one per container. Each keeps the last lines it received.
pub struct LogRegistry {
    client: Arc<dyn KubeClient>,
    streams: Arc<Mutex<HashMap<LogStreamKey, LogStream>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LogRegistry {
    pub fn new(client: Arc<dyn KubeClient>) -> Self {
        Self::with_capacity(client, DEFAULT_LOG_BUFFER_LINES)
    }

    /// Each stream keeps at least one line.
    pub fn with_capacity(client: Arc<dyn KubeClient>, capacity: usize) -> Self {
        LogRegistry {
            client,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Starts following `key`, replacing a stream already running for it.
    pub fn start(&self, key: LogStreamKey) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let lines: LineBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let previous = self
            .streams
            .lock()
            .expect("Failed to lock log streams")
            .insert(
                key.clone(),
                LogStream {
                    id,
                    token: token.clone(),
                    lines: lines.clone(),
                },
            );
        if let Some(previous) = previous {
            debug!("Replacing log stream {key}");
            previous.token.cancel();
        }

        let client = self.client.clone();
        let streams = self.streams.clone();
        let capacity = self.capacity;
        tokio::spawn(async move {
            info!("Log stream {key} started");
            let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
            let follow = client.follow_pod_logs(&key.namespace, &key.pod, &key.container, tx);
            let drain = async {
                while let Some(line) = rx.recv().await {
                    let mut buf = lines.lock().expect("Failed to lock log buffer");
                    while buf.len() >= capacity {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            };
            tokio::select! {
                _ = token.cancelled() => debug!("Log stream {key} cancelled"),
                (result, ()) = async { tokio::join!(follow, drain) } => match result {
                    Ok(()) => debug!("Log stream {key} ended"),
                    Err(err) => warn!("Log stream {key} failed: {err}"),
                },
            }
            let mut streams = streams.lock().expect("Failed to lock log streams");
            if streams.get(&key).is_some_and(|s| s.id == id) {
                streams.remove(&key);
            }
        });
    }

    /// Non-blocking, the stream winds down in the background.
    pub fn stop(&self, key: &LogStreamKey) -> bool {
        let removed = self
            .streams
            .lock()
            .expect("Failed to lock log streams")
            .remove(key);
        match removed {
            Some(stream) => {
                stream.token.cancel();
                info!("Log stream {key} stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let drained: Vec<(LogStreamKey, LogStream)> = self
            .streams
            .lock()
            .expect("Failed to lock log streams")
            .drain()
            .collect();
        for (_, stream) in &drained {
            stream.token.cancel();
        }
        if !drained.is_empty() {
            info!("Stopped {} log stream(s)", drained.len());
        }
        drained.len()
    }

    pub fn lines(&self, key: &LogStreamKey) -> Option<Vec<String>> {
        let streams = self.streams.lock().expect("Failed to lock log streams");
        let stream = streams.get(key)?;
        let lines = stream
            .lines
            .lock()
            .expect("Failed to lock log buffer")
            .iter()
            .cloned()
            .collect();
        Some(lines)
    }

    pub fn active(&self) -> Vec<LogStreamKey> {
        let mut keys: Vec<LogStreamKey> = self
            .streams
            .lock()
            .expect("Failed to lock log streams")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
