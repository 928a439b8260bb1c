use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
  pub size: u64,
  pub etag: String,
}

/// Narrow facet over object storage. The control plane never constructs
/// object URLs itself; everything goes through presign/head/copy/delete/list.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  async fn presign(&self, key: &str, duration_secs: u32) -> Result<String>;

  async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

  /// Server-side copy into another bucket of the same endpoint.
  async fn copy_to(&self, key: &str, dest_bucket: &str, dest_key: &str) -> Result<()>;

  async fn delete(&self, key: &str) -> Result<()>;

  async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
