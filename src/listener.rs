#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::cache::RecentVideoCache;
use crate::client::{InboundMessage, NetworkClient};
use crate::entities::EntityResolver;
use crate::metadata::extract;

/// Pause after a failed update poll before polling again.
const UPDATE_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Feeds videos posted by monitored publishers into the recent cache.
pub struct InboundListener {
    resolver: Arc<EntityResolver>,
    cache: Arc<RecentVideoCache>,
    public_url: String,
}

impl InboundListener {
    pub fn new(
        resolver: Arc<EntityResolver>,
        cache: Arc<RecentVideoCache>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            cache,
            public_url: public_url.into(),
        }
    }

    /// Polls the client for new messages until the process exits.
    pub async fn run(&self, client: Arc<dyn NetworkClient>) {
        loop {
            match client.next_update().await {
                Ok(Some(message)) => {
                    self.handle(client.as_ref(), &message).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "update poll failed");
                    tokio::time::sleep(UPDATE_ERROR_PAUSE).await;
                }
            }
        }
    }

    /// Caches `message` if it is a video from a monitored publisher. Returns
    /// whether a new record was inserted.
    pub async fn handle(&self, client: &dyn NetworkClient, message: &InboundMessage) -> bool {
        if !self.resolver.is_resolved() {
            match client.is_authorized().await {
                Ok(true) => {
                    self.resolver.resolve_all(client).await;
                }
                _ => return false,
            }
        }

        let sender = message.sender_id.unwrap_or(message.chat_id);
        let Some(bot_name) = self.resolver.name_for(sender) else {
            return false;
        };
        let Some(record) = extract(message) else {
            debug!(publisher = %bot_name, message_id = message.id, "skipping non-video message");
            return false;
        };

        let record = record.with_source(bot_name, &self.public_url);
        let caption: String = record.caption.chars().take(30).collect();
        let publisher = record.bot_name.clone();
        let inserted = self.cache.push(record);
        if inserted {
            info!(publisher = %publisher, caption = %caption, "video cached");
        }
        inserted
    }
}
