#![forbid(unsafe_code)]

//! Concurrent search across every resolved publisher.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{info, warn};

use crate::client::{Media, NetworkClient};
use crate::entities::{EntityResolver, PublisherEntity};
use crate::error::{ClientError, GatewayError};
use crate::metadata::{VideoMetadata, extract};

/// Rejects empty or whitespace-only queries.
pub fn validate_query(query: Option<&str>) -> Result<&str, GatewayError> {
    match query {
        Some(query) if !query.trim().is_empty() => Ok(query),
        _ => Err(GatewayError::Validation(
            "Parameter 'query' is required for search.".to_string(),
        )),
    }
}

pub struct SearchEngine {
    resolver: Arc<EntityResolver>,
    public_url: String,
    per_publisher_limit: usize,
    timeout: Duration,
}

impl SearchEngine {
    pub fn new(
        resolver: Arc<EntityResolver>,
        public_url: impl Into<String>,
        per_publisher_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            public_url: public_url.into(),
            per_publisher_limit,
            timeout,
        }
    }

    /// Searches every publisher concurrently and flattens the results.
    ///
    /// Results keep each publisher's order; publishers are not interleaved in
    /// any guaranteed order. A failing publisher contributes nothing, but an
    /// unauthorized session or a publisher list that resolves to nothing fails
    /// the whole request with [`GatewayError::ExternalUnavailable`]. When the
    /// whole operation exceeds the timeout the error is [`GatewayError::Timeout`]
    /// and the per-publisher tasks are left to finish in the background.
    pub async fn search(
        &self,
        client: Arc<dyn NetworkClient>,
        query: &str,
    ) -> Result<Vec<VideoMetadata>, GatewayError> {
        match client.is_authorized().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(GatewayError::ExternalUnavailable(
                    "session is not authorized; sign in through /login".to_string(),
                ));
            }
            Err(err) => {
                return Err(GatewayError::ExternalUnavailable(format!(
                    "authorization check failed: {err}"
                )));
            }
        }

        if !self.resolver.is_resolved() {
            self.resolver.resolve_all(client.as_ref()).await;
        }
        let publishers = self.resolver.resolved();
        if publishers.is_empty() {
            return Err(GatewayError::ExternalUnavailable(
                "none of the configured publishers could be resolved".to_string(),
            ));
        }

        let tasks = publishers.into_iter().map(|publisher| {
            let client = client.clone();
            let query = query.to_string();
            let public_url = self.public_url.clone();
            let limit = self.per_publisher_limit;
            tokio::spawn(async move {
                match search_publisher(client.as_ref(), &publisher, &query, limit, &public_url).await
                {
                    Ok(results) => results,
                    Err(err) => {
                        warn!(error = %err, "publisher search failed");
                        Vec::new()
                    }
                }
            })
        });

        let joined = tokio::time::timeout(self.timeout, join_all(tasks))
            .await
            .map_err(|_| {
                warn!(query, timeout = ?self.timeout, "search timed out");
                GatewayError::Timeout {
                    duration: self.timeout,
                }
            })?;

        let mut results = Vec::new();
        for outcome in joined {
            match outcome {
                Ok(batch) => results.extend(batch),
                Err(err) => warn!(error = %err, "publisher search task aborted"),
            }
        }
        info!(query, found = results.len(), "search finished");
        Ok(results)
    }
}

/// Searches one publisher's most recent messages and keeps the videos.
async fn search_publisher(
    client: &dyn NetworkClient,
    publisher: &PublisherEntity,
    query: &str,
    limit: usize,
    public_url: &str,
) -> Result<Vec<VideoMetadata>, GatewayError> {
    let messages = client
        .search_messages(publisher.id, query, limit)
        .await
        .map_err(|err| GatewayError::PublisherUnreachable {
            publisher: publisher.name.clone(),
            reason: match err {
                ClientError::ChannelPrivate(_) => "private or missing channel".to_string(),
                other => other.to_string(),
            },
        })?;

    Ok(messages
        .iter()
        .filter(|message| matches!(message.media, Some(Media::Document(_))))
        .filter_map(extract)
        .map(|record| record.with_source(publisher.name.clone(), public_url))
        .collect())
}
