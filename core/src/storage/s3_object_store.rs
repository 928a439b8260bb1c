use super::object_store::{ObjectMeta, ObjectStore};
use crate::settings::StorageSettings;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use s3::{creds::Credentials, Bucket, Region};

pub struct S3ObjectStore {
  bucket: Box<Bucket>,
  settings: StorageSettings,
}

fn build_bucket(settings: &StorageSettings, bucket_name: &str) -> Result<Box<Bucket>> {
  Ok(Bucket::new(
    bucket_name,
    Region::Custom {
      region: settings.region.clone(),
      endpoint: settings.endpoint.clone(),
    },
    Credentials::new(
      Some(&settings.key),
      Some(&settings.secret),
      None,
      None,
      None,
    )?,
  )?)
}

impl S3ObjectStore {
  pub fn new(settings: StorageSettings, bucket_name: &str) -> Result<Self> {
    Ok(Self {
      bucket: build_bucket(&settings, bucket_name)?,
      settings,
    })
  }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
  async fn presign(&self, key: &str, duration_secs: u32) -> Result<String> {
    self
      .bucket
      .presign_get(key, duration_secs, None)
      .await
      .map_err(|e| e.into())
  }

  async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
    let (result, code) = self.bucket.head_object(key).await?;
    if code == 404 {
      return Ok(None);
    }
    if code >= 300 {
      return Err(anyhow!("head_object returned status {}", code));
    }
    Ok(Some(ObjectMeta {
      size: result.content_length.unwrap_or(0).max(0) as u64,
      etag: result.e_tag.unwrap_or_default(),
    }))
  }

  async fn copy_to(&self, key: &str, dest_bucket: &str, dest_key: &str) -> Result<()> {
    let response = self.bucket.get_object(key).await?;
    let dest = build_bucket(&self.settings, dest_bucket)?;
    dest.put_object(dest_key, response.bytes()).await?;
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    self.bucket.delete_object(key).await?;
    Ok(())
  }

  async fn list(&self, prefix: &str) -> Result<Vec<String>> {
    let pages = self.bucket.list(prefix.to_string(), None).await?;
    Ok(
      pages
        .into_iter()
        .flat_map(|page| page.contents.into_iter().map(|object| object.key))
        .collect(),
    )
  }
}
