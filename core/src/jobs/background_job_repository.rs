use super::background_job::BackgroundJob;
use crate::helpers::document_store::{document_filter::DocumentFilter, DocumentStore, QueryOptions};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const BACKGROUND_JOBS_COLLECTION: &str = "background_jobs";

pub struct BackgroundJobRepository {
  document_store: Arc<DocumentStore>,
}

impl BackgroundJobRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(
        BACKGROUND_JOBS_COLLECTION,
        vec!["type", "success", "finished", "oid", "started"],
      )]))
      .await
  }

  pub async fn put(&self, job: &BackgroundJob) -> Result<()> {
    self
      .document_store
      .put(BACKGROUND_JOBS_COLLECTION, &job.id, job, None)
      .await
  }

  pub async fn find(&self, id: &str) -> Result<Option<BackgroundJob>> {
    Ok(
      self
        .document_store
        .find::<BackgroundJob>(BACKGROUND_JOBS_COLLECTION, id)
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn get(&self, id: &str) -> Result<BackgroundJob> {
    self
      .find(id)
      .await?
      .ok_or_else(|| anyhow!("Background job not found: {}", id))
  }

  #[instrument(skip(self))]
  pub async fn mark_finished(&self, id: &str, success: bool) -> Result<()> {
    self
      .document_store
      .set_fields(
        BACKGROUND_JOBS_COLLECTION,
        id,
        vec![
          ("finished", serde_json::json!(Utc::now())),
          ("success", serde_json::json!(success)),
        ],
      )
      .await
  }

  /// Unfinished jobs started before the cutoff; candidates for stuck-job
  /// recovery. ISO timestamps compare correctly as strings.
  pub async fn list_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackgroundJob>> {
    let mut filter = DocumentFilter::new();
    filter
      .condition("finished", "IS", None::<String>)
      .condition(
        "started",
        "<",
        cutoff.format("%Y-%m-%dT%H:%M:%S").to_string(),
      );
    Ok(
      self
        .document_store
        .query::<BackgroundJob>(
          BACKGROUND_JOBS_COLLECTION,
          filter.build(),
          QueryOptions::default(),
        )
        .await?
        .documents
        .into_iter()
        .map(|doc| doc.document)
        .collect(),
    )
  }

  /// Org cascade helper; spares the running delete-org job's own document.
  pub async fn delete_by_org_except(&self, oid: &Uuid, keep_id: &str) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter
      .condition("oid", "=", oid.to_string())
      .condition("id", "!=", keep_id.to_string());
    self
      .document_store
      .delete_matching(BACKGROUND_JOBS_COLLECTION, filter.build())
      .await
  }
}
