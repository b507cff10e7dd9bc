//! Mutation events and the in-process hub that fans them out.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::lock::{read_lock, write_lock};

const SOURCE: &str = "cache::events";

/// Kind of write reported by the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    #[serde(alias = "afterCreate")]
    Create,
    #[serde(alias = "afterUpdate")]
    Update,
    #[serde(alias = "afterDelete")]
    Delete,
    #[serde(alias = "afterCreateMany")]
    CreateMany,
    #[serde(alias = "afterUpdateMany")]
    UpdateMany,
    #[serde(alias = "afterDeleteMany")]
    DeleteMany,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateMany => "createMany",
            Self::UpdateMany => "updateMany",
            Self::DeleteMany => "deleteMany",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed write to a collection.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    /// Publish order within this process; assigned by the hub.
    pub sequence: u64,
    pub kind: OperationKind,
    pub collection: String,
    pub timestamp: OffsetDateTime,
}

impl MutationEvent {
    pub fn new(kind: OperationKind, collection: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            kind,
            collection: collection.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    All,
    Collection(String),
}

impl Topic {
    pub fn matches(&self, event: &MutationEvent) -> bool {
        match self {
            Self::All => true,
            Self::Collection(name) => *name == event.collection,
        }
    }
}

/// Receives mutation events. Implementations handle their own failures.
#[async_trait]
pub trait MutationSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_mutation(&self, event: &MutationEvent);
}

/// Publish/subscribe hub for mutation events.
///
/// `publish` awaits every matching subscriber before returning, so callers
/// observe invalidation as complete once it resolves.
#[derive(Default)]
pub struct MutationHub {
    subscribers: RwLock<Vec<(Topic, Arc<dyn MutationSubscriber>)>>,
    sequence: AtomicU64,
}

impl MutationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, subscriber: Arc<dyn MutationSubscriber>) {
        debug!(subscriber = subscriber.name(), topic = ?topic, "mutation subscriber added");
        write_lock(&self.subscribers, SOURCE, "subscribe").push((topic, subscriber));
    }

    /// Subscribe one collection topic per name.
    pub fn subscribe_collections<I, S>(&self, collections: I, subscriber: Arc<dyn MutationSubscriber>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for collection in collections {
            self.subscribe(Topic::Collection(collection.into()), subscriber.clone());
        }
    }

    /// Deliver `event` to every matching subscriber; returns how many ran.
    pub async fn publish(&self, mut event: MutationEvent) -> usize {
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let targets: Vec<Arc<dyn MutationSubscriber>> = read_lock(&self.subscribers, SOURCE, "publish")
            .iter()
            .filter(|(topic, _)| topic.matches(&event))
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        debug!(
            event_id = %event.id,
            sequence = event.sequence,
            kind = %event.kind,
            collection = %event.collection,
            subscribers = targets.len(),
            "publishing mutation event"
        );

        for subscriber in &targets {
            subscriber.on_mutation(&event).await;
        }

        targets.len()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}
