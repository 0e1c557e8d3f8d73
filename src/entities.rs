#![forbid(unsafe_code)]

//! Publisher name to id resolution, memoized for the process lifetime.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::NetworkClient;

/// A configured publisher and the id the network resolved it to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherEntity {
    pub name: String,
    pub id: i64,
}

pub struct EntityResolver {
    publishers: Vec<String>,
    resolved: RwLock<Vec<PublisherEntity>>,
    // Serializes resolution passes so concurrent callers share one result.
    flight: tokio::sync::Mutex<()>,
}

impl EntityResolver {
    pub fn new(publishers: Vec<String>) -> Self {
        Self {
            publishers,
            resolved: RwLock::new(Vec::new()),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn publishers(&self) -> &[String] {
        &self.publishers
    }

    /// Resolves every configured publisher once.
    ///
    /// No-op when the mapping is already populated; it is never refreshed.
    /// A publisher that fails to resolve is logged and skipped. If every
    /// publisher fails the mapping stays empty and the next call retries.
    pub async fn resolve_all(&self, client: &dyn NetworkClient) -> HashMap<String, i64> {
        if !self.resolved.read().is_empty() {
            return self.mapping();
        }

        let _flight = self.flight.lock().await;
        if !self.resolved.read().is_empty() {
            return self.mapping();
        }

        info!(count = self.publishers.len(), "resolving publisher entities");
        let mut resolved = Vec::with_capacity(self.publishers.len());
        for name in &self.publishers {
            match client.resolve_entity(name).await {
                Ok(id) => {
                    info!(publisher = %name, id, "publisher resolved");
                    if !resolved.iter().any(|entity: &PublisherEntity| entity.id == id) {
                        resolved.push(PublisherEntity {
                            name: name.clone(),
                            id,
                        });
                    }
                }
                Err(err) => warn!(publisher = %name, error = %err, "failed to resolve publisher"),
            }
        }
        *self.resolved.write() = resolved;
        self.mapping()
    }

    pub fn mapping(&self) -> HashMap<String, i64> {
        self.resolved
            .read()
            .iter()
            .map(|entity| (entity.name.clone(), entity.id))
            .collect()
    }

    /// Resolved publishers in configured order.
    pub fn resolved(&self) -> Vec<PublisherEntity> {
        self.resolved.read().clone()
    }

    pub fn is_resolved(&self) -> bool {
        !self.resolved.read().is_empty()
    }

    pub fn name_for(&self, id: i64) -> Option<String> {
        self.resolved
            .read()
            .iter()
            .find(|entity| entity.id == id)
            .map(|entity| entity.name.clone())
    }

    /// Every configured publisher with whether it has been resolved.
    pub fn statuses(&self) -> Vec<(String, bool)> {
        let resolved = self.resolved.read();
        self.publishers
            .iter()
            .map(|name| {
                let done = resolved.iter().any(|entity| &entity.name == name);
                (name.clone(), done)
            })
            .collect()
    }
}
