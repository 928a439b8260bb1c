use super::{object_store::ObjectStore, s3_object_store::S3ObjectStore, storage_ref::StorageRef};
use crate::settings::StorageSettings;
use anyhow::Result;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Resolves logical storage references to live object-store clients, one
/// client per bucket for the life of the process.
pub struct StorageResolver {
  settings: StorageSettings,
  clients: Mutex<HashMap<String, Arc<S3ObjectStore>>>,
}

impl StorageResolver {
  pub fn new(settings: StorageSettings) -> Self {
    Self {
      settings,
      clients: Mutex::new(HashMap::new()),
    }
  }

  pub async fn resolve(&self, storage_ref: &StorageRef) -> Result<Arc<dyn ObjectStore>> {
    let mut clients = self.clients.lock().await;
    if let Some(client) = clients.get(&storage_ref.name) {
      return Ok(Arc::clone(client) as Arc<dyn ObjectStore>);
    }
    let client = Arc::new(S3ObjectStore::new(
      self.settings.clone(),
      &storage_ref.name,
    )?);
    clients.insert(storage_ref.name.clone(), Arc::clone(&client));
    Ok(client as Arc<dyn ObjectStore>)
  }

  /// Replica storages every primary file should be copied to.
  pub fn replica_refs(&self) -> Vec<StorageRef> {
    self
      .settings
      .replica_buckets
      .iter()
      .map(|bucket| StorageRef::new(bucket.clone()))
      .collect()
  }
}
