use crate::{orgs::exec_seconds::ExecPools, storage::storage_ref::StorageRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrgQuotas {
  pub max_concurrent_crawls: u32,
  pub max_pages_per_crawl: u32,
  pub storage_quota: u64,
  pub max_exec_minutes_per_month: u64,
  pub extra_exec_minutes: u64,
  pub gifted_exec_minutes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
  pub sub_id: String,
  pub status: String,
}

/// Which storage pool a byte delta is attributed to, mirrored by the
/// per-type `bytesStored*` counters on the org document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredBytesKind {
  Crawls,
  Uploads,
  Profiles,
  SeedFiles,
  Thumbnails,
}

impl StoredBytesKind {
  pub fn counter_path(&self) -> &'static str {
    match self {
      StoredBytesKind::Crawls => "bytesStoredCrawls",
      StoredBytesKind::Uploads => "bytesStoredUploads",
      StoredBytesKind::Profiles => "bytesStoredProfiles",
      StoredBytesKind::SeedFiles => "bytesStoredSeedFiles",
      StoredBytesKind::Thumbnails => "bytesStoredThumbnails",
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Organization {
  pub id: Uuid,
  pub name: String,
  pub slug: String,
  pub created: Option<DateTime<Utc>>,
  pub quotas: OrgQuotas,
  pub bytes_stored: i64,
  pub bytes_stored_crawls: i64,
  pub bytes_stored_uploads: i64,
  pub bytes_stored_profiles: i64,
  pub bytes_stored_seed_files: i64,
  pub bytes_stored_thumbnails: i64,
  pub monthly_exec_seconds: BTreeMap<String, u64>,
  pub extra_exec_seconds: BTreeMap<String, u64>,
  pub gifted_exec_seconds: BTreeMap<String, u64>,
  pub extra_exec_seconds_available: u64,
  pub gifted_exec_seconds_available: u64,
  pub read_only: bool,
  pub subscription: Option<Subscription>,
  pub storage: StorageRef,
  pub storage_replicas: Vec<StorageRef>,
}

impl Organization {
  pub fn exec_pools(&self, yymm: &str) -> ExecPools {
    ExecPools {
      monthly_used: self.monthly_exec_seconds.get(yymm).copied().unwrap_or(0),
      monthly_quota_secs: self.quotas.max_exec_minutes_per_month * 60,
      extra_available: self.extra_exec_seconds_available,
      gifted_available: self.gifted_exec_seconds_available,
    }
  }

  /// Total execution seconds still spendable this month across all pools.
  /// A zero monthly quota means execution time is not metered.
  pub fn exec_seconds_remaining(&self, yymm: &str) -> Option<u64> {
    if self.quotas.max_exec_minutes_per_month == 0 {
      return None;
    }
    Some(self.exec_pools(yymm).total_remaining())
  }

  pub fn storage_quota_reached(&self, projected_additional_bytes: u64) -> bool {
    if self.quotas.storage_quota == 0 {
      return false;
    }
    self.bytes_stored.max(0) as u64 + projected_additional_bytes >= self.quotas.storage_quota
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn org_with_quotas(quotas: OrgQuotas) -> Organization {
    Organization {
      id: Uuid::new_v4(),
      name: "test org".to_string(),
      slug: "test-org".to_string(),
      quotas,
      ..Default::default()
    }
  }

  #[test]
  fn test_unmetered_org_has_no_exec_limit() {
    let org = org_with_quotas(OrgQuotas::default());
    assert_eq!(org.exec_seconds_remaining("2026-08"), None);
  }

  #[test]
  fn test_exec_seconds_remaining_includes_all_pools() {
    let mut org = org_with_quotas(OrgQuotas {
      max_exec_minutes_per_month: 10,
      ..Default::default()
    });
    org.monthly_exec_seconds.insert("2026-08".to_string(), 400);
    org.extra_exec_seconds_available = 30;
    org.gifted_exec_seconds_available = 20;
    assert_eq!(org.exec_seconds_remaining("2026-08"), Some(200 + 30 + 20));
  }

  #[test]
  fn test_storage_quota_projection() {
    let mut org = org_with_quotas(OrgQuotas {
      storage_quota: 1000,
      ..Default::default()
    });
    org.bytes_stored = 900;
    assert!(!org.storage_quota_reached(50));
    assert!(org.storage_quota_reached(100));
    org.quotas.storage_quota = 0;
    assert!(!org.storage_quota_reached(u64::MAX / 2));
  }
}
