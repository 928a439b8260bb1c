use super::workflow::Workflow;
use crate::{
  crawls::crawl::CrawlState,
  helpers::document_store::{document_filter::DocumentFilter, DocumentStore, QueryOptions},
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const WORKFLOWS_COLLECTION: &str = "workflows";

pub struct WorkflowRepository {
  document_store: Arc<DocumentStore>,
}

impl WorkflowRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(
        WORKFLOWS_COLLECTION,
        vec!["oid", "schedule", "seedFileId"],
      )]))
      .await
  }

  pub async fn put(&self, workflow: &Workflow) -> Result<()> {
    workflow.validate_seed_source()?;
    workflow.validate_exclusions()?;
    self
      .document_store
      .put(WORKFLOWS_COLLECTION, &workflow.id.to_string(), workflow, None)
      .await
  }

  pub async fn find(&self, cid: &Uuid) -> Result<Option<Workflow>> {
    Ok(
      self
        .document_store
        .find::<Workflow>(WORKFLOWS_COLLECTION, &cid.to_string())
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn get(&self, cid: &Uuid) -> Result<Workflow> {
    self
      .find(cid)
      .await?
      .ok_or_else(|| anyhow!("Workflow not found: {}", cid))
  }

  /// Every workflow with a non-empty schedule, the cron materializer's input.
  pub async fn list_scheduled(&self) -> Result<Vec<Workflow>> {
    let mut filter = DocumentFilter::new();
    filter
      .condition("schedule", "IS NOT", None::<String>)
      .condition("schedule", "!=", "")
      .condition("inactive", "=", false);
    Ok(
      self
        .document_store
        .query::<Workflow>(WORKFLOWS_COLLECTION, filter.build(), QueryOptions::default())
        .await?
        .documents
        .into_iter()
        .map(|doc| doc.document)
        .collect(),
    )
  }

  /// Derived-state recompute on a terminal crawl transition: bumps the run
  /// counters, adds the crawl's bytes, and records the last-crawl pointers.
  #[instrument(skip(self))]
  pub async fn record_crawl_finished(
    &self,
    cid: &Uuid,
    crawl_id: &str,
    state: CrawlState,
    finished: DateTime<Utc>,
    size: u64,
  ) -> Result<()> {
    let mut counters: Vec<(&str, i64)> = vec![("crawlCount", 1)];
    if state.is_successful() {
      counters.push(("crawlSuccessfulCount", 1));
      counters.push(("totalSize", size as i64));
    }
    self
      .document_store
      .inc_counters(WORKFLOWS_COLLECTION, &cid.to_string(), counters)
      .await?;
    self
      .document_store
      .set_fields(
        WORKFLOWS_COLLECTION,
        &cid.to_string(),
        vec![
          ("lastCrawlId", serde_json::json!(crawl_id)),
          ("lastCrawlState", serde_json::json!(state)),
          ("lastCrawlTime", serde_json::json!(finished)),
        ],
      )
      .await
  }

  pub async fn count_referencing_seed_file(&self, seed_file_id: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("seedFileId", "=", seed_file_id.to_string());
    self
      .document_store
      .count(WORKFLOWS_COLLECTION, filter.build())
      .await
  }

  pub async fn set_inactive(&self, cid: &Uuid, inactive: bool) -> Result<()> {
    self
      .document_store
      .set_fields(
        WORKFLOWS_COLLECTION,
        &cid.to_string(),
        vec![("inactive", serde_json::json!(inactive))],
      )
      .await
  }

  pub async fn delete(&self, cid: &Uuid) -> Result<()> {
    self
      .document_store
      .delete(WORKFLOWS_COLLECTION, &cid.to_string())
      .await
  }

  pub async fn delete_by_org(&self, oid: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("oid", "=", oid.to_string());
    self
      .document_store
      .delete_matching(WORKFLOWS_COLLECTION, filter.build())
      .await
  }
}
