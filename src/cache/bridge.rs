//! Turns mutation events into resource-path invalidation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::events::{MutationEvent, MutationHub, MutationSubscriber, Topic};
use super::invalidation::Invalidator;

/// Public API prefix collections are served under.
const API_PREFIX: &str = "/api";

/// Resource path cached responses for `collection` live under.
///
/// Returns `None` when the name is blank after trimming slashes.
pub fn resource_path(collection: &str) -> Option<String> {
    let name = collection.trim().trim_matches('/');
    if name.is_empty() {
        return None;
    }
    Some(format!("{API_PREFIX}/{name}"))
}

pub struct MutationBridge {
    invalidator: Arc<Invalidator>,
}

impl MutationBridge {
    pub fn new(invalidator: Arc<Invalidator>) -> Self {
        Self { invalidator }
    }

    /// Attach a bridge to every event published on `hub`.
    pub fn attach(hub: &MutationHub, invalidator: Arc<Invalidator>) {
        hub.subscribe(Topic::All, Arc::new(Self::new(invalidator)));
    }
}

#[async_trait]
impl MutationSubscriber for MutationBridge {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    async fn on_mutation(&self, event: &MutationEvent) {
        let Some(path) = resource_path(&event.collection) else {
            warn!(
                target = "readthrough::cache::bridge",
                event_id = %event.id,
                kind = %event.kind,
                "Ignoring mutation event without a collection name"
            );
            return;
        };

        let count = self.invalidator.invalidate_by_resource_path(&path).await;
        debug!(
            event_id = %event.id,
            kind = %event.kind,
            path = %path,
            count,
            "mutation invalidated cache entries"
        );
    }
}
