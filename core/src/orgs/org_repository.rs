use super::org::{Organization, OrgQuotas, StoredBytesKind};
use crate::{
  helpers::document_store::{document_filter::DocumentFilter, DocumentStore, QueryOptions},
  orgs::exec_seconds::DebitSplit,
};
use anyhow::{anyhow, Result};
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const ORGS_COLLECTION: &str = "organizations";

/// Month-keyed map entries need quoted path segments ("2026-08" contains a dash).
fn month_path(prefix: &str, yymm: &str) -> String {
  format!("{}.\"{}\"", prefix, yymm)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoredBytesTotals {
  pub crawls: i64,
  pub uploads: i64,
  pub profiles: i64,
  pub seed_files: i64,
  pub thumbnails: i64,
}

impl StoredBytesTotals {
  pub fn total(&self) -> i64 {
    self.crawls + self.uploads + self.profiles + self.seed_files + self.thumbnails
  }
}

pub struct OrgRepository {
  document_store: Arc<DocumentStore>,
}

impl OrgRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(ORGS_COLLECTION, vec!["slug"])]))
      .await?;
    self
      .document_store
      .setup_unique_indexes(HashMap::from([(ORGS_COLLECTION, vec![vec!["slug"]])]))
      .await
  }

  #[instrument(skip(self, org))]
  pub async fn insert(&self, org: &Organization) -> Result<()> {
    self
      .document_store
      .insert(ORGS_COLLECTION, &org.id.to_string(), org)
      .await
  }

  pub async fn put(&self, org: &Organization) -> Result<()> {
    self
      .document_store
      .put(ORGS_COLLECTION, &org.id.to_string(), org, None)
      .await
  }

  pub async fn find(&self, oid: &Uuid) -> Result<Option<Organization>> {
    Ok(
      self
        .document_store
        .find::<Organization>(ORGS_COLLECTION, &oid.to_string())
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn get(&self, oid: &Uuid) -> Result<Organization> {
    self
      .find(oid)
      .await?
      .ok_or_else(|| anyhow!("Organization not found: {}", oid))
  }

  pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
    let mut filter = DocumentFilter::new();
    // LIKE without wildcards is a case-insensitive equality in sqlite
    filter.condition("slug", "LIKE", slug.to_string());
    Ok(
      self
        .document_store
        .find_by_filter::<Organization>(ORGS_COLLECTION, filter.build())
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn list(&self) -> Result<Vec<Organization>> {
    Ok(
      self
        .document_store
        .query::<Organization>(
          ORGS_COLLECTION,
          DocumentFilter::new(),
          QueryOptions::default(),
        )
        .await?
        .documents
        .into_iter()
        .map(|doc| doc.document)
        .collect(),
    )
  }

  pub async fn delete(&self, oid: &Uuid) -> Result<()> {
    self
      .document_store
      .delete(ORGS_COLLECTION, &oid.to_string())
      .await
  }

  /// Storage accounting; both the total and the per-type counter move in one
  /// atomic statement. Deletes pass a negative delta.
  #[instrument(skip(self))]
  pub async fn inc_stored_bytes(
    &self,
    oid: &Uuid,
    kind: StoredBytesKind,
    delta: i64,
  ) -> Result<()> {
    self
      .document_store
      .inc_counters(
        ORGS_COLLECTION,
        &oid.to_string(),
        vec![("bytesStored", delta), (kind.counter_path(), delta)],
      )
      .await
  }

  /// Replaces the `bytesStored*` counters wholesale (recalculation job).
  pub async fn set_stored_bytes(&self, oid: &Uuid, totals: StoredBytesTotals) -> Result<()> {
    self
      .document_store
      .set_fields(
        ORGS_COLLECTION,
        &oid.to_string(),
        vec![
          ("bytesStored", serde_json::json!(totals.total())),
          ("bytesStoredCrawls", serde_json::json!(totals.crawls)),
          ("bytesStoredUploads", serde_json::json!(totals.uploads)),
          ("bytesStoredProfiles", serde_json::json!(totals.profiles)),
          ("bytesStoredSeedFiles", serde_json::json!(totals.seed_files)),
          (
            "bytesStoredThumbnails",
            serde_json::json!(totals.thumbnails),
          ),
        ],
      )
      .await
  }

  /// Applies a debit split: month-keyed usage grows per pool, and the extra /
  /// gifted available balances shrink by what they absorbed.
  #[instrument(skip(self))]
  pub async fn debit_exec_seconds(&self, oid: &Uuid, yymm: &str, split: &DebitSplit) -> Result<()> {
    let mut deltas: Vec<(String, i64)> = Vec::new();
    if split.monthly > 0 {
      deltas.push((month_path("monthlyExecSeconds", yymm), split.monthly as i64));
    }
    if split.extra > 0 {
      deltas.push((month_path("extraExecSeconds", yymm), split.extra as i64));
      deltas.push((
        "extraExecSecondsAvailable".to_string(),
        -(split.extra as i64),
      ));
    }
    if split.gifted > 0 {
      deltas.push((month_path("giftedExecSeconds", yymm), split.gifted as i64));
      deltas.push((
        "giftedExecSecondsAvailable".to_string(),
        -(split.gifted as i64),
      ));
    }
    if deltas.is_empty() {
      return Ok(());
    }
    let deltas_refs = deltas
      .iter()
      .map(|(path, delta)| (path.as_str(), *delta))
      .collect::<Vec<_>>();
    self
      .document_store
      .inc_counters(ORGS_COLLECTION, &oid.to_string(), deltas_refs)
      .await
  }

  pub async fn update_quotas(&self, oid: &Uuid, quotas: &OrgQuotas) -> Result<()> {
    self
      .document_store
      .set_fields(
        ORGS_COLLECTION,
        &oid.to_string(),
        vec![("quotas", serde_json::to_value(quotas)?)],
      )
      .await
  }

  pub async fn set_read_only(&self, oid: &Uuid, read_only: bool) -> Result<()> {
    self
      .document_store
      .set_fields(
        ORGS_COLLECTION,
        &oid.to_string(),
        vec![("readOnly", serde_json::json!(read_only))],
      )
      .await
  }
}
