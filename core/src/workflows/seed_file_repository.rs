use super::workflow::SeedFile;
use crate::helpers::document_store::{document_filter::DocumentFilter, DocumentStore, QueryOptions};
use anyhow::Result;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

pub const SEED_FILES_COLLECTION: &str = "seed_files";

pub struct SeedFileRepository {
  document_store: Arc<DocumentStore>,
}

impl SeedFileRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(SEED_FILES_COLLECTION, vec!["oid"])]))
      .await
  }

  pub async fn put(&self, seed_file: &SeedFile) -> Result<()> {
    self
      .document_store
      .put(
        SEED_FILES_COLLECTION,
        &seed_file.id.to_string(),
        seed_file,
        None,
      )
      .await
  }

  pub async fn find(&self, id: &Uuid) -> Result<Option<SeedFile>> {
    Ok(
      self
        .document_store
        .find::<SeedFile>(SEED_FILES_COLLECTION, &id.to_string())
        .await?
        .map(|doc| doc.document),
    )
  }

  pub async fn list(&self) -> Result<Vec<SeedFile>> {
    Ok(
      self
        .document_store
        .query::<SeedFile>(
          SEED_FILES_COLLECTION,
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

  pub async fn delete(&self, id: &Uuid) -> Result<()> {
    self
      .document_store
      .delete(SEED_FILES_COLLECTION, &id.to_string())
      .await
  }

  pub async fn delete_by_org(&self, oid: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("oid", "=", oid.to_string());
    self
      .document_store
      .delete_matching(SEED_FILES_COLLECTION, filter.build())
      .await
  }
}
