use super::collection::Collection;
use crate::helpers::document_store::{document_filter::DocumentFilter, DocumentStore};
use anyhow::Result;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const COLLECTIONS_COLLECTION: &str = "collections";

pub struct CollectionRepository {
  document_store: Arc<DocumentStore>,
}

impl CollectionRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(COLLECTIONS_COLLECTION, vec!["oid"])]))
      .await?;
    self
      .document_store
      .setup_unique_indexes(HashMap::from([(
        COLLECTIONS_COLLECTION,
        vec![vec!["oid", "name"], vec!["oid", "slug"]],
      )]))
      .await
  }

  pub async fn insert(&self, collection: &Collection) -> Result<()> {
    self
      .document_store
      .insert(COLLECTIONS_COLLECTION, &collection.id.to_string(), collection)
      .await
  }

  pub async fn put(&self, collection: &Collection) -> Result<()> {
    self
      .document_store
      .put(
        COLLECTIONS_COLLECTION,
        &collection.id.to_string(),
        collection,
        None,
      )
      .await
  }

  pub async fn find(&self, id: &Uuid) -> Result<Option<Collection>> {
    Ok(
      self
        .document_store
        .find::<Collection>(COLLECTIONS_COLLECTION, &id.to_string())
        .await?
        .map(|doc| doc.document),
    )
  }

  /// Adds a finished crawl to the collection and bumps the aggregates.
  /// Re-adding the same crawl is a no-op so finalization can be retried.
  #[instrument(skip(self))]
  pub async fn add_successful_crawl(
    &self,
    id: &Uuid,
    crawl_id: &str,
    size: u64,
    page_count: u64,
  ) -> Result<bool> {
    let Some(mut collection) = self.find(id).await? else {
      return Ok(false);
    };
    if collection.crawl_ids.iter().any(|existing| existing == crawl_id) {
      return Ok(false);
    }
    collection.crawl_ids.push(crawl_id.to_string());
    collection.crawl_count += 1;
    collection.total_size += size;
    collection.page_count += page_count;
    collection.modified = Some(Utc::now());
    self.put(&collection).await?;
    Ok(true)
  }

  pub async fn delete_by_org(&self, oid: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("oid", "=", oid.to_string());
    self
      .document_store
      .delete_matching(COLLECTIONS_COLLECTION, filter.build())
      .await
  }
}
