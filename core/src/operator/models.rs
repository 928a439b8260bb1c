use crate::crawls::crawl::{CrawlState, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub const BTRIX_API: &str = "btrix.cloud/v1";

pub const POD: &str = "Pod.v1";

pub const METRICS_API: &str = "metrics.k8s.io/v1beta1";
pub const METRICS: &str = "PodMetrics.metrics.k8s.io/v1beta1";

pub const LABEL_CRAWL: &str = "btrix.crawl";
pub const LABEL_ORG: &str = "btrix.org";
pub const LABEL_CONFIG: &str = "btrix.configid";
pub const LABEL_CRAWLCONFIG: &str = "btrix.crawlconfig";

/// Seconds children of a finished crawl stay around before garbage collection.
pub const DEFAULT_TTL: i64 = 30;

/// Time before a crawl with no heartbeat is deemed 'waiting' instead of 'starting'.
pub const STARTING_TIME_SECS: i64 = 150;

/// How often execution-time seconds are rolled into the org accounting.
pub const EXEC_TIME_UPDATE_SECS: i64 = 60;

pub const MEM_SCALE_UP_THRESHOLD: f64 = 0.90;
pub const MEM_SCALE_UP: f64 = 1.2;
pub const MEM_SOFT_OOM_THRESHOLD: f64 = 1.0;
pub const MEM_LIMIT_PADDING: f64 = 1.2;

/// Meta-controller sync envelope: current parent plus observed children,
/// keyed `Kind.Version` then object name.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
  pub parent: serde_json::Value,
  #[serde(default)]
  pub children: HashMap<String, HashMap<String, serde_json::Value>>,
  #[serde(default)]
  pub related: HashMap<String, HashMap<String, serde_json::Value>>,
  #[serde(default)]
  pub finalizing: bool,
}

impl SyncRequest {
  pub fn children_of_kind(&self, kind: &str) -> impl Iterator<Item = (&String, &serde_json::Value)> {
    self.children.get(kind).into_iter().flatten()
  }

  pub fn related_of_kind(&self, kind: &str) -> impl Iterator<Item = (&String, &serde_json::Value)> {
    self.related.get(kind).into_iter().flatten()
  }
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
  pub status: serde_json::Value,
  pub children: Vec<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resync_after_seconds: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub finalized: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeRequest {
  pub parent: serde_json::Value,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeResponse {
  pub related_resources: Vec<RelatedResourceRule>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceRule {
  pub api_version: String,
  pub resource: String,
  pub label_selector: serde_json::Value,
}

/// Parsed `CrawlJob.btrix.cloud/v1` spec. `scale` is the legacy alias for
/// `browserWindows`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJobSpec {
  pub id: String,
  #[serde(rename = "configId", alias = "cid")]
  pub cid: Uuid,
  #[serde(rename = "orgId", alias = "oid")]
  pub oid: Uuid,
  #[serde(default)]
  pub userid: Option<Uuid>,
  #[serde(default = "default_browser_windows", alias = "scale")]
  pub browser_windows: u32,
  #[serde(default)]
  pub timeout: i64,
  #[serde(default)]
  pub max_crawl_size: u64,
  #[serde(default)]
  pub manual: bool,
  #[serde(default)]
  pub scheduled: bool,
  #[serde(default)]
  pub stopping: bool,
  #[serde(default)]
  pub paused: bool,
  #[serde(default = "default_storage_name")]
  pub storage_name: String,
  #[serde(default)]
  pub profile_filename: Option<String>,
}

fn default_browser_windows() -> u32 {
  1
}

fn default_storage_name() -> String {
  "default".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProfileJobSpec {
  pub id: String,
  #[serde(rename = "orgId", alias = "oid")]
  pub oid: Uuid,
  #[serde(default)]
  pub userid: Option<Uuid>,
  #[serde(default)]
  pub profile_filename: Option<String>,
  pub start_url: String,
  #[serde(default)]
  pub base_profile_filename: Option<String>,
  pub expiry_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceAmounts {
  pub memory: u64,
  pub cpu: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PodInfo {
  pub used: ResourceAmounts,
  pub allocated: ResourceAmounts,
  pub new_memory: Option<u64>,
  pub is_new_exit: bool,
  pub exit_code: Option<i32>,
  pub reason: Option<String>,
  pub signal_time: Option<DateTime<Utc>>,
  /// Memory ratio was above the scale-up threshold on the previous reconcile.
  pub mem_high: bool,
  pub soft_oom: bool,
  pub worker_state: Option<String>,
}

impl PodInfo {
  pub fn is_alive(&self) -> bool {
    self.exit_code.is_none()
  }

  pub fn exited_cleanly(&self) -> bool {
    self.exit_code == Some(0)
  }
}

/// Computed `.status` written back to the CrawlJob. Everything here is
/// rebuilt from observed state each reconcile; nothing is accumulated
/// in memory between calls.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlStatus {
  pub state: CrawlState,
  pub size: u64,
  pub pages_found: u64,
  pub pages_done: u64,
  pub files_added: u64,
  pub files_added_size: u64,
  pub pod_status: BTreeMap<String, PodInfo>,
  pub start_time: Option<DateTime<Utc>>,
  pub last_updated_time: Option<DateTime<Utc>>,
  pub last_exec_update: Option<DateTime<Utc>>,
  pub finished: Option<DateTime<Utc>>,
  pub stop_reason: Option<StopReason>,
  pub crawler_image: Option<String>,
  pub paused_at: Option<DateTime<Utc>>,
  /// Accumulated paused wall time, excluded from time-limit accrual.
  pub paused_duration_secs: u64,
  pub error_detail: Option<String>,
  pub resync: bool,
}

impl CrawlStatus {
  pub fn parse_from_parent(parent: &serde_json::Value) -> Self {
    parent
      .get("status")
      .cloned()
      .and_then(|status| serde_json::from_value(status).ok())
      .unwrap_or_default()
  }

  /// Elapsed crawl time counted against the wall-clock timeout; paused
  /// intervals do not accrue.
  pub fn active_duration_secs(&self, now: DateTime<Utc>) -> i64 {
    let Some(start) = self.start_time else {
      return 0;
    };
    let mut elapsed = (now - start).num_seconds() - self.paused_duration_secs as i64;
    if let Some(paused_at) = self.paused_at {
      elapsed -= (now - paused_at).num_seconds();
    }
    elapsed.max(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_crawl_job_spec_aliases() {
    let spec: CrawlJobSpec = serde_json::from_value(serde_json::json!({
      "id": "c-1",
      "configId": "8f2b2e3a-38f1-4f52-bd55-6d173a1f9f2f",
      "orgId": "72ef7e0b-45c4-4b9e-a1d0-0f2a80ad9173",
      "scale": 4,
      "storageName": "default"
    }))
    .unwrap();
    assert_eq!(spec.browser_windows, 4);
    assert!(!spec.stopping);
  }

  #[test]
  fn test_status_roundtrip_defaults() {
    let status = CrawlStatus::parse_from_parent(&serde_json::json!({"spec": {}}));
    assert_eq!(status.state, CrawlState::Starting);
    assert_eq!(status.pages_done, 0);
  }

  #[test]
  fn test_active_duration_excludes_paused_time() {
    let start = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 11, 0, 0).unwrap();
    let status = CrawlStatus {
      start_time: Some(start),
      paused_duration_secs: 600,
      paused_at: Some(Utc.with_ymd_and_hms(2026, 8, 1, 10, 50, 0).unwrap()),
      ..Default::default()
    };
    // one hour minus 10 min accumulated minus 10 min currently paused
    assert_eq!(status.active_duration_secs(now), 2400);
  }
}
