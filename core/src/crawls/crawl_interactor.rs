use super::{crawl::CrawlType, crawl_repository::CrawlRepository, page_repository::PageRepository};
use crate::{
  jobs::background_jobs::BackgroundJobService,
  orgs::{org::StoredBytesKind, org_repository::OrgRepository},
  storage::{storage_ref::StorageRef, storage_resolver::StorageResolver},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Crawl-level cascade: a deleted crawl loses its replicas (through the
/// grace-window jobs), then its primary objects, then its pages and document,
/// with the org's byte counters debited along the way.
pub struct CrawlInteractor {
  crawl_repository: Arc<CrawlRepository>,
  page_repository: Arc<PageRepository>,
  org_repository: Arc<OrgRepository>,
  storage_resolver: Arc<StorageResolver>,
  background_jobs: Arc<BackgroundJobService>,
}

impl CrawlInteractor {
  pub fn new(
    crawl_repository: Arc<CrawlRepository>,
    page_repository: Arc<PageRepository>,
    org_repository: Arc<OrgRepository>,
    storage_resolver: Arc<StorageResolver>,
    background_jobs: Arc<BackgroundJobService>,
  ) -> Self {
    Self {
      crawl_repository,
      page_repository,
      org_repository,
      storage_resolver,
      background_jobs,
    }
  }

  /// With `use_grace_window`, replica removal goes through delete-replica
  /// jobs and their deletion delay; the org-deletion cascade passes false and
  /// removes replicas immediately.
  #[instrument(skip(self))]
  pub async fn delete_crawl(&self, id: &str, use_grace_window: bool) -> Result<()> {
    let Some(crawl) = self.crawl_repository.find(id).await? else {
      return Ok(());
    };

    let mut deleted_bytes = 0i64;
    for file in &crawl.files {
      for replica in &file.replicas {
        if use_grace_window {
          self
            .background_jobs
            .enqueue_delete_replica(
              crawl.oid,
              "crawl",
              id,
              &replica.path,
              StorageRef::new(replica.name.clone()),
            )
            .await?;
        } else {
          let store = self
            .storage_resolver
            .resolve(&StorageRef::new(replica.name.clone()))
            .await?;
          if let Err(e) = store.delete(&replica.path).await {
            warn!(
              file = replica.path.as_str(),
              err = e.to_string(),
              "Failed to delete replica object"
            );
          }
        }
      }
      let store = self.storage_resolver.resolve(&file.storage).await?;
      if let Err(e) = store.delete(&file.filename).await {
        warn!(
          file = file.filename.as_str(),
          err = e.to_string(),
          "Failed to delete primary object"
        );
      }
      deleted_bytes += file.size as i64;
    }

    if deleted_bytes > 0 {
      let kind = match crawl.crawl_type {
        CrawlType::Upload => StoredBytesKind::Uploads,
        _ => StoredBytesKind::Crawls,
      };
      self
        .org_repository
        .inc_stored_bytes(&crawl.oid, kind, -deleted_bytes)
        .await?;
    }

    self.page_repository.delete_by_crawl(id).await?;
    self.crawl_repository.delete(id).await?;
    info!(crawl_id = id, "Crawl deleted");
    Ok(())
  }
}
