use super::page::Page;
use crate::helpers::document_store::{document_filter::DocumentFilter, DocumentStore};
use anyhow::Result;
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

pub const PAGES_COLLECTION: &str = "pages";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
  pub total: u64,
  pub unique_urls: u64,
  pub files: u64,
  pub errors: u64,
}

pub struct PageRepository {
  document_store: Arc<DocumentStore>,
}

impl PageRepository {
  pub fn new(document_store: Arc<DocumentStore>) -> Self {
    Self { document_store }
  }

  pub async fn setup_indexes(&self) -> Result<()> {
    self
      .document_store
      .setup_indexes(HashMap::from([(PAGES_COLLECTION, vec!["crawlId", "oid"])]))
      .await
  }

  #[instrument(skip(self, pages))]
  pub async fn put_many(&self, pages: Vec<Page>) -> Result<()> {
    if pages.is_empty() {
      return Ok(());
    }
    let entries = pages
      .iter()
      .map(|page| (page.id.as_str(), page, None))
      .collect::<Vec<_>>();
    self.document_store.put_many(PAGES_COLLECTION, entries).await
  }

  fn crawl_filter(crawl_id: &str) -> DocumentFilter {
    let mut filter = DocumentFilter::new();
    filter.condition("crawlId", "=", crawl_id.to_string());
    filter.build()
  }

  pub async fn counts_for_crawl(&self, crawl_id: &str) -> Result<PageCounts> {
    let total = self
      .document_store
      .count(PAGES_COLLECTION, Self::crawl_filter(crawl_id))
      .await? as u64;
    let unique_urls = self
      .document_store
      .count_distinct(PAGES_COLLECTION, "url", Self::crawl_filter(crawl_id))
      .await? as u64;
    let mut files_filter = DocumentFilter::new();
    files_filter
      .condition("crawlId", "=", crawl_id.to_string())
      .condition("isFile", "=", true);
    let files = self
      .document_store
      .count(PAGES_COLLECTION, files_filter.build())
      .await? as u64;
    let mut errors_filter = DocumentFilter::new();
    errors_filter
      .condition("crawlId", "=", crawl_id.to_string())
      .condition("isError", "=", true);
    let errors = self
      .document_store
      .count(PAGES_COLLECTION, errors_filter.build())
      .await? as u64;
    Ok(PageCounts {
      total,
      unique_urls,
      files,
      errors,
    })
  }

  pub async fn delete_by_crawl(&self, crawl_id: &str) -> Result<usize> {
    self
      .document_store
      .delete_matching(PAGES_COLLECTION, Self::crawl_filter(crawl_id))
      .await
  }

  pub async fn delete_by_org(&self, oid: &Uuid) -> Result<usize> {
    let mut filter = DocumentFilter::new();
    filter.condition("oid", "=", oid.to_string());
    self
      .document_store
      .delete_matching(PAGES_COLLECTION, filter.build())
      .await
  }
}
