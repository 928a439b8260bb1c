use super::crawl::{Crawl, CrawlFile, CrawlState, CrawlStats, FileReplica, StopReason};
use crate::helpers::document_store::{document_filter::DocumentFilter, DocumentStore};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const CRAWLS_COLLECTION: &str = "crawls";

/// States that occupy a concurrent-crawl slot. Crawls parked in
/// `waiting_org_limit` are excluded so the limit check cannot deadlock on
/// itself; paused crawls hold no browser capacity either.
const ACTIVE_SLOT_STATES: [CrawlState; 4] = [
  CrawlState::Starting,
  CrawlState::WaitingCapacity,
  CrawlState::Running,
  CrawlState::Stopping,
];

pub struct CrawlRepository {
  document_store: Arc<DocumentStore>,
}

impl CrawlRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(
        CRAWLS_COLLECTION,
        vec!["oid", "cid", "state", "type", "finished"],
      )]))
      .await
  }

  pub async fn put(&self, crawl: &Crawl) -> Result<()> {
    self
      .document_store
      .put(CRAWLS_COLLECTION, &crawl.id, crawl, None)
      .await
  }

  pub async fn find(&self, id: &str) -> Result<Option<Crawl>> {
    Ok(
      self
        .document_store
        .find::<Crawl>(CRAWLS_COLLECTION, id)
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn get(&self, id: &str) -> Result<Crawl> {
    self
      .find(id)
      .await?
      .ok_or_else(|| anyhow!("Crawl not found: {}", id))
  }

  #[instrument(skip(self))]
  pub async fn update_state(&self, id: &str, state: CrawlState) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![("state", serde_json::json!(state))],
      )
      .await
  }

  #[instrument(skip(self))]
  pub async fn mark_finished(
    &self,
    id: &str,
    state: CrawlState,
    finished: DateTime<Utc>,
    stop_reason: Option<StopReason>,
  ) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![
          ("state", serde_json::json!(state)),
          ("finished", serde_json::json!(finished)),
          ("stopReason", serde_json::json!(stop_reason)),
        ],
      )
      .await
  }

  pub async fn set_flags(&self, id: &str, stopping: bool, paused: bool) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![
          ("stopping", serde_json::json!(stopping)),
          ("paused", serde_json::json!(paused)),
        ],
      )
      .await
  }

  pub async fn update_stats(&self, id: &str, stats: &CrawlStats) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![("stats", serde_json::to_value(stats)?)],
      )
      .await
  }

  pub async fn update_page_counts(
    &self,
    id: &str,
    page_count: u64,
    unique_page_count: u64,
    file_page_count: u64,
    error_page_count: u64,
  ) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![
          ("pageCount", serde_json::json!(page_count)),
          ("uniquePageCount", serde_json::json!(unique_page_count)),
          ("filePageCount", serde_json::json!(file_page_count)),
          ("errorPageCount", serde_json::json!(error_page_count)),
        ],
      )
      .await
  }

  /// Installs the finalized WACZ file list. Files are write-once; this is
  /// only called from the finalization step.
  pub async fn set_files(&self, id: &str, files: &[CrawlFile]) -> Result<()> {
    self
      .document_store
      .set_fields(
        CRAWLS_COLLECTION,
        id,
        vec![("files", serde_json::to_value(files)?)],
      )
      .await
  }

  pub async fn append_logs(
    &self,
    id: &str,
    errors: &[serde_json::Value],
    behavior_logs: &[serde_json::Value],
  ) -> Result<()> {
    if errors.is_empty() && behavior_logs.is_empty() {
      return Ok(());
    }
    let mut crawl = self.get(id).await?;
    crawl.errors.extend_from_slice(errors);
    crawl.behavior_logs.extend_from_slice(behavior_logs);
    self.put(&crawl).await
  }

  /// Appends a replica entry to the named file, skipping if already present
  /// so replica jobs stay idempotent.
  #[instrument(skip(self))]
  pub async fn add_file_replica(
    &self,
    id: &str,
    filename: &str,
    replica: FileReplica,
  ) -> Result<()> {
    let mut crawl = self.get(id).await?;
    let file = crawl
      .files
      .iter_mut()
      .find(|file| file.filename == filename)
      .ok_or_else(|| anyhow!("File not found on crawl {}: {}", id, filename))?;
    if file.replicas.contains(&replica) {
      return Ok(());
    }
    file.replicas.push(replica);
    self.put(&crawl).await
  }

  pub async fn remove_file_replica(&self, id: &str, filename: &str, name: &str) -> Result<()> {
    let mut crawl = self.get(id).await?;
    if let Some(file) = crawl.files.iter_mut().find(|file| file.filename == filename) {
      file.replicas.retain(|replica| replica.name != name);
    }
    self.put(&crawl).await
  }

  /// Slots taken by crawls other than the one asking; a crawl never counts
  /// itself against the limit.
  pub async fn count_active_slots(&self, oid: &Uuid, exclude_crawl_id: &str) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter
      .condition("oid", "=", oid.to_string())
      .condition("id", "!=", exclude_crawl_id.to_string())
      .any_of(
        "state",
        ACTIVE_SLOT_STATES
          .iter()
          .map(|state| state.as_str())
          .collect(),
      );
    self
      .document_store
      .count(CRAWLS_COLLECTION, filter.build())
      .await
  }

  /// Whether any crawl of this workflow is still live (used by the schedule
  /// materializer's slow-down rule).
  pub async fn has_active_crawl_for_config(&self, cid: &Uuid) -> Result<bool> {
    let mut active_states = ACTIVE_SLOT_STATES
      .iter()
      .map(|state| state.as_str())
      .collect::<Vec<_>>();
    active_states.extend(
      super::crawl::PAUSED_STATES
        .iter()
        .map(|state| state.as_str()),
    );
    let mut filter = DocumentFilter::new();
    filter
      .condition("cid", "=", cid.to_string())
      .any_of("state", active_states);
    Ok(
      self
        .document_store
        .count(CRAWLS_COLLECTION, filter.build())
        .await?
        > 0,
    )
  }

  pub fn stream_by_org<'a>(
    &'a self,
    oid: &'a Uuid,
    batch_size: usize,
  ) -> impl Stream<Item = Result<Vec<crate::helpers::document_store::Document<Crawl>>>> + 'a {
    self.document_store.stream_query::<Crawl>(
      CRAWLS_COLLECTION,
      move || {
        let mut filter = DocumentFilter::new();
        filter.condition("oid", "=", oid.to_string());
        filter.build()
      },
      batch_size,
    )
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    self.document_store.delete(CRAWLS_COLLECTION, id).await
  }

  pub async fn delete_by_org(&self, oid: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("oid", "=", oid.to_string());
    self
      .document_store
      .delete_matching(CRAWLS_COLLECTION, filter.build())
      .await
  }
}
