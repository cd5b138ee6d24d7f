//! Per-project event channels.
//!
//! The provider's WebSocket multiplexes every project of this client on
//! one connection. [`ProjectChannels`] fans raw events out to one
//! `tokio::sync::broadcast` channel per project so each job handle only
//! sees its own project's traffic.
//!
//! Events can arrive before the REST call that created the project has
//! returned. Those are held in a short per-project backlog and replayed
//! into the channel when the first subscriber appears. Backlogs nobody
//! claims expire after [`BACKLOG_TTL`], and the oldest one is evicted
//! when too many projects are waiting.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

/// Buffer capacity of each project's broadcast channel.
pub const PROJECT_CHANNEL_CAPACITY: usize = 256;

/// Maximum number of early events held for a project nobody subscribed to yet.
pub const BACKLOG_LIMIT: usize = 32;

/// Maximum number of distinct unclaimed projects held in the backlog.
pub const BACKLOG_PROJECTS_LIMIT: usize = 64;

/// How long early events wait for a subscriber before [`ProjectChannels::prune`]
/// drops them. Matches the longest a creation call is allowed to take.
pub const BACKLOG_TTL: Duration = Duration::from_secs(60);

struct Backlog {
    since: Instant,
    events: VecDeque<serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    senders: HashMap<String, broadcast::Sender<serde_json::Value>>,
    backlog: HashMap<String, Backlog>,
}

impl Inner {
    fn evict_oldest_backlog(&mut self) {
        let oldest = self
            .backlog
            .iter()
            .min_by_key(|(_, b)| b.since)
            .map(|(id, _)| id.clone());
        if let Some(project_id) = oldest {
            if let Some(dropped) = self.backlog.remove(&project_id) {
                tracing::warn!(
                    project_id = %project_id,
                    count = dropped.events.len(),
                    "Backlog full, evicting unclaimed project",
                );
            }
        }
    }
}

/// Routes raw provider events to per-project subscribers.
#[derive(Default)]
pub struct ProjectChannels {
    inner: RwLock<Inner>,
}

impl ProjectChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a project's events, replaying any backlog.
    pub async fn subscribe(&self, project_id: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut inner = self.inner.write().await;
        let sender = inner
            .senders
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(PROJECT_CHANNEL_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();

        if let Some(early) = inner.backlog.remove(project_id) {
            tracing::debug!(project_id, count = early.events.len(), "Replaying early events");
            for event in early.events {
                let _ = sender.send(event);
            }
        }
        receiver
    }

    /// Deliver one raw event.
    ///
    /// Events with a `projectId` go to that project (or its backlog);
    /// events without one go to every open project and the engine's
    /// correlator decides whether they belong anywhere.
    pub async fn route(&self, event: serde_json::Value) {
        let project_id = event
            .get("projectId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match project_id {
            Some(project_id) => {
                {
                    let inner = self.inner.read().await;
                    if let Some(sender) = inner.senders.get(&project_id) {
                        let _ = sender.send(event);
                        return;
                    }
                }
                let mut inner = self.inner.write().await;
                if let Some(sender) = inner.senders.get(&project_id) {
                    let _ = sender.send(event);
                    return;
                }
                if !inner.backlog.contains_key(&project_id)
                    && inner.backlog.len() >= BACKLOG_PROJECTS_LIMIT
                {
                    inner.evict_oldest_backlog();
                }
                let queue = &mut inner
                    .backlog
                    .entry(project_id)
                    .or_insert_with(|| Backlog {
                        since: Instant::now(),
                        events: VecDeque::new(),
                    })
                    .events;
                if queue.len() >= BACKLOG_LIMIT {
                    queue.pop_front();
                }
                queue.push_back(event);
            }
            None => {
                let inner = self.inner.read().await;
                for sender in inner.senders.values() {
                    let _ = sender.send(event.clone());
                }
            }
        }
    }

    /// Drop channels that no longer have any subscriber, and early
    /// events that waited longer than [`BACKLOG_TTL`]. Returns the number
    /// of channels dropped.
    pub async fn prune(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.senders.len();
        inner.senders.retain(|_, sender| sender.receiver_count() > 0);

        let waiting = inner.backlog.len();
        inner.backlog.retain(|_, b| b.since.elapsed() < BACKLOG_TTL);
        let expired = waiting - inner.backlog.len();
        if expired > 0 {
            tracing::debug!(expired, "Dropped unclaimed early events");
        }

        before - inner.senders.len()
    }

    /// Number of projects with an open channel.
    pub async fn project_count(&self) -> usize {
        self.inner.read().await.senders.len()
    }

    /// Number of projects with early events waiting for a subscriber.
    pub async fn backlog_count(&self) -> usize {
        self.inner.read().await.backlog.len()
    }
}
