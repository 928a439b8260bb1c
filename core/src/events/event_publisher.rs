use super::event::Event;
use crate::helpers::document_store::DocumentStore;
use anyhow::Result;
use chrono::Utc;
use rustis::{bb8::Pool, client::PooledClientManager, commands::ListCommands};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

pub const EVENTS_COLLECTION: &str = "webhook_events";
const NOTIFICATION_LIST_KEY: &str = "events:webhooks";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
  id: String,
  oid: Uuid,
  created_at: chrono::DateTime<Utc>,
  #[serde(flatten)]
  event: Event,
}

/// Persists every event and pushes a notification onto the shared redis list
/// for the out-of-scope webhook sender to drain.
pub struct EventPublisher {
  redis_connection_pool: Arc<Pool<PooledClientManager>>,
  document_store: Arc<DocumentStore>,
}

impl EventPublisher {
  pub fn new(
    redis_connection_pool: Arc<Pool<PooledClientManager>>,
    document_store: Arc<DocumentStore>,
  ) -> Self {
    Self {
      redis_connection_pool,
      document_store,
    }
  }

  #[instrument(skip(self, event))]
  pub async fn publish(&self, event: Event) -> Result<()> {
    let stored = StoredEvent {
      id: Ulid::new().to_string(),
      oid: event.oid(),
      created_at: Utc::now(),
      event,
    };
    self
      .document_store
      .put(EVENTS_COLLECTION, &stored.id, &stored, None)
      .await?;

    let connection = self.redis_connection_pool.get().await?;
    let _count: usize = connection
      .rpush(NOTIFICATION_LIST_KEY, serde_json::to_string(&stored)?)
      .await?;
    Ok(())
  }
}
