use crate::storage::storage_ref::StorageRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackgroundJobType {
  CreateReplica,
  DeleteReplica,
  DeleteOrg,
  RecalculateOrgStats,
  ReAddOrgPages,
  CleanupSeedFiles,
  OptimizePages,
  MigrationJob,
}

/// One unit of deferred work. `finished`/`success` stay null until the job
/// completes; once `finished` is set, `success` is final.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundJob {
  pub id: String,
  #[serde(rename = "type")]
  pub job_type: BackgroundJobType,
  pub started: DateTime<Utc>,
  #[serde(default)]
  pub finished: Option<DateTime<Utc>>,
  #[serde(default)]
  pub success: Option<bool>,
  #[serde(default)]
  pub oid: Option<Uuid>,
  #[serde(default)]
  pub file_path: Option<String>,
  #[serde(default)]
  pub object_type: Option<String>,
  #[serde(default)]
  pub object_id: Option<String>,
  #[serde(default)]
  pub replica_storage: Option<StorageRef>,
}

impl BackgroundJob {
  pub fn new(job_type: BackgroundJobType) -> Self {
    Self {
      id: Ulid::new().to_string(),
      job_type,
      started: Utc::now(),
      finished: None,
      success: None,
      oid: None,
      file_path: None,
      object_type: None,
      object_id: None,
      replica_storage: None,
    }
  }

  pub fn create_replica(
    oid: Uuid,
    object_type: &str,
    object_id: &str,
    file_path: &str,
    replica_storage: StorageRef,
  ) -> Self {
    Self {
      oid: Some(oid),
      object_type: Some(object_type.to_string()),
      object_id: Some(object_id.to_string()),
      file_path: Some(file_path.to_string()),
      replica_storage: Some(replica_storage),
      ..Self::new(BackgroundJobType::CreateReplica)
    }
  }

  pub fn delete_replica(
    oid: Uuid,
    object_type: &str,
    object_id: &str,
    file_path: &str,
    replica_storage: StorageRef,
  ) -> Self {
    Self {
      oid: Some(oid),
      object_type: Some(object_type.to_string()),
      object_id: Some(object_id.to_string()),
      file_path: Some(file_path.to_string()),
      replica_storage: Some(replica_storage),
      ..Self::new(BackgroundJobType::DeleteReplica)
    }
  }

  pub fn delete_org(oid: Uuid) -> Self {
    Self {
      oid: Some(oid),
      ..Self::new(BackgroundJobType::DeleteOrg)
    }
  }

  pub fn recalculate_org_stats(oid: Uuid) -> Self {
    Self {
      oid: Some(oid),
      ..Self::new(BackgroundJobType::RecalculateOrgStats)
    }
  }

  pub fn re_add_org_pages(oid: Uuid) -> Self {
    Self {
      oid: Some(oid),
      ..Self::new(BackgroundJobType::ReAddOrgPages)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_job_type_wire_strings() {
    assert_eq!(
      serde_json::to_string(&BackgroundJobType::CreateReplica).unwrap(),
      "\"create-replica\""
    );
    assert_eq!(
      serde_json::to_string(&BackgroundJobType::RecalculateOrgStats).unwrap(),
      "\"recalculate-org-stats\""
    );
  }

  #[test]
  fn test_new_job_is_unfinished() {
    let job = BackgroundJob::delete_org(Uuid::new_v4());
    assert!(job.finished.is_none());
    assert!(job.success.is_none());
    assert!(!job.id.is_empty());
  }
}
