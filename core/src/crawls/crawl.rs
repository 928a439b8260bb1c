use crate::storage::storage_ref::StorageRef;
use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Closed state set of the crawl lifecycle. Wire strings are part of the
/// custom-resource contract and must never change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CrawlState {
  #[default]
  #[serde(rename = "starting")]
  Starting,
  #[serde(rename = "waiting_capacity")]
  WaitingCapacity,
  #[serde(rename = "waiting_org_limit")]
  WaitingOrgLimit,
  #[serde(rename = "running")]
  Running,
  #[serde(rename = "stopping")]
  Stopping,
  #[serde(rename = "paused")]
  Paused,
  #[serde(rename = "paused_storage_quota_reached")]
  PausedStorageQuotaReached,
  #[serde(rename = "paused_time_quota_reached")]
  PausedTimeQuotaReached,
  #[serde(rename = "complete")]
  Complete,
  #[serde(rename = "complete:partial")]
  CompletePartial,
  #[serde(rename = "complete:user-stop")]
  CompleteUserStop,
  #[serde(rename = "complete:size-limit")]
  CompleteSizeLimit,
  #[serde(rename = "complete:time-limit")]
  CompleteTimeLimit,
  #[serde(rename = "failed")]
  Failed,
  #[serde(rename = "canceled")]
  Canceled,
  #[serde(rename = "skipped_storage_quota_reached")]
  SkippedStorageQuotaReached,
  #[serde(rename = "skipped_time_quota_reached")]
  SkippedTimeQuotaReached,
  #[serde(rename = "failed_not_logged_in")]
  FailedNotLoggedIn,
}

pub const SUCCESSFUL_STATES: [CrawlState; 5] = [
  CrawlState::Complete,
  CrawlState::CompletePartial,
  CrawlState::CompleteUserStop,
  CrawlState::CompleteSizeLimit,
  CrawlState::CompleteTimeLimit,
];

pub const FAILED_STATES: [CrawlState; 5] = [
  CrawlState::Failed,
  CrawlState::Canceled,
  CrawlState::SkippedStorageQuotaReached,
  CrawlState::SkippedTimeQuotaReached,
  CrawlState::FailedNotLoggedIn,
];

pub const PAUSED_STATES: [CrawlState; 3] = [
  CrawlState::Paused,
  CrawlState::PausedStorageQuotaReached,
  CrawlState::PausedTimeQuotaReached,
];

pub const WAITING_STATES: [CrawlState; 3] = [
  CrawlState::Starting,
  CrawlState::WaitingCapacity,
  CrawlState::WaitingOrgLimit,
];

impl CrawlState {
  pub fn is_running(&self) -> bool {
    matches!(self, CrawlState::Running | CrawlState::Stopping)
  }

  pub fn is_waiting(&self) -> bool {
    WAITING_STATES.contains(self)
  }

  pub fn is_paused(&self) -> bool {
    PAUSED_STATES.contains(self)
  }

  pub fn is_successful(&self) -> bool {
    SUCCESSFUL_STATES.contains(self)
  }

  pub fn is_failed(&self) -> bool {
    FAILED_STATES.contains(self)
  }

  pub fn is_terminal(&self) -> bool {
    self.is_successful() || self.is_failed()
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      CrawlState::Starting => "starting",
      CrawlState::WaitingCapacity => "waiting_capacity",
      CrawlState::WaitingOrgLimit => "waiting_org_limit",
      CrawlState::Running => "running",
      CrawlState::Stopping => "stopping",
      CrawlState::Paused => "paused",
      CrawlState::PausedStorageQuotaReached => "paused_storage_quota_reached",
      CrawlState::PausedTimeQuotaReached => "paused_time_quota_reached",
      CrawlState::Complete => "complete",
      CrawlState::CompletePartial => "complete:partial",
      CrawlState::CompleteUserStop => "complete:user-stop",
      CrawlState::CompleteSizeLimit => "complete:size-limit",
      CrawlState::CompleteTimeLimit => "complete:time-limit",
      CrawlState::Failed => "failed",
      CrawlState::Canceled => "canceled",
      CrawlState::SkippedStorageQuotaReached => "skipped_storage_quota_reached",
      CrawlState::SkippedTimeQuotaReached => "skipped_time_quota_reached",
      CrawlState::FailedNotLoggedIn => "failed_not_logged_in",
    }
  }

  /// Only the operator writes states, and a terminal state is frozen: any
  /// attempt to leave it is an invariant violation surfaced to the caller.
  pub fn transition(&self, next: CrawlState) -> anyhow::Result<CrawlState> {
    if *self == next {
      return Ok(next);
    }
    if self.is_terminal() {
      bail!(
        "Refusing transition out of terminal state {} -> {}",
        self.as_str(),
        next.as_str()
      );
    }
    if next == CrawlState::Starting {
      bail!("Refusing transition back to starting from {}", self.as_str());
    }
    Ok(next)
  }
}

impl std::fmt::Display for CrawlState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for CrawlState {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
      .map_err(|_| anyhow::anyhow!("Unknown crawl state: {}", s))
  }
}

/// Why a stop was initiated; recorded on the status and used to pick the
/// terminal state at finalization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  #[serde(rename = "stopped_by_user")]
  UserStop,
  #[serde(rename = "size-limit")]
  SizeLimit,
  #[serde(rename = "time-limit")]
  TimeLimit,
  #[serde(rename = "stopped_storage_quota_reached")]
  StorageQuota,
  #[serde(rename = "stopped_time_quota_reached")]
  TimeQuota,
  #[serde(rename = "stopped_org_readonly")]
  OrgReadOnly,
  #[serde(rename = "stopped_pause_expired")]
  PauseExpired,
}

impl StopReason {
  /// Terminal state for a graceful stop that still produced output.
  pub fn successful_state(&self) -> CrawlState {
    match self {
      StopReason::UserStop | StopReason::PauseExpired => CrawlState::CompleteUserStop,
      StopReason::SizeLimit | StopReason::StorageQuota => CrawlState::CompleteSizeLimit,
      StopReason::TimeLimit | StopReason::TimeQuota => CrawlState::CompleteTimeLimit,
      StopReason::OrgReadOnly => CrawlState::CompleteUserStop,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrawlType {
  #[default]
  Crawl,
  Upload,
  Qa,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
  pub found: u64,
  pub done: u64,
  pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileReplica {
  pub name: String,
  pub path: String,
}

/// One WACZ artifact. Write-once except `replicas`, which grows as replica
/// jobs succeed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrawlFile {
  pub filename: String,
  pub hash: String,
  pub size: u64,
  pub storage: StorageRef,
  #[serde(default)]
  pub replicas: Vec<FileReplica>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Crawl {
  pub id: String,
  pub oid: Uuid,
  pub cid: Uuid,
  pub userid: Option<Uuid>,
  #[serde(rename = "type")]
  pub crawl_type: CrawlType,
  pub started: Option<DateTime<Utc>>,
  pub finished: Option<DateTime<Utc>>,
  pub state: CrawlState,
  pub stopping: bool,
  pub paused: bool,
  pub scheduled: bool,
  pub manual: bool,
  pub files: Vec<CrawlFile>,
  pub stats: CrawlStats,
  pub file_page_count: u64,
  pub error_page_count: u64,
  pub page_count: u64,
  pub unique_page_count: u64,
  pub errors: Vec<serde_json::Value>,
  pub behavior_logs: Vec<serde_json::Value>,
  pub stop_reason: Option<StopReason>,
  pub crawler_image: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_wire_strings() {
    assert_eq!(
      serde_json::to_string(&CrawlState::CompleteUserStop).unwrap(),
      "\"complete:user-stop\""
    );
    assert_eq!(
      serde_json::to_string(&CrawlState::PausedStorageQuotaReached).unwrap(),
      "\"paused_storage_quota_reached\""
    );
    assert_eq!(
      CrawlState::from_str("complete:size-limit").unwrap(),
      CrawlState::CompleteSizeLimit
    );
    assert!(CrawlState::from_str("bogus").is_err());
  }

  #[test]
  fn test_state_partitions_are_disjoint_and_total() {
    let all = [
      CrawlState::Starting,
      CrawlState::WaitingCapacity,
      CrawlState::WaitingOrgLimit,
      CrawlState::Running,
      CrawlState::Stopping,
      CrawlState::Paused,
      CrawlState::PausedStorageQuotaReached,
      CrawlState::PausedTimeQuotaReached,
      CrawlState::Complete,
      CrawlState::CompletePartial,
      CrawlState::CompleteUserStop,
      CrawlState::CompleteSizeLimit,
      CrawlState::CompleteTimeLimit,
      CrawlState::Failed,
      CrawlState::Canceled,
      CrawlState::SkippedStorageQuotaReached,
      CrawlState::SkippedTimeQuotaReached,
      CrawlState::FailedNotLoggedIn,
    ];
    for state in all {
      let memberships = [
        state.is_running(),
        state.is_waiting(),
        state.is_paused(),
        state.is_successful(),
        state.is_failed(),
      ];
      assert_eq!(
        memberships.iter().filter(|m| **m).count(),
        1,
        "state {} must belong to exactly one partition",
        state
      );
    }
  }

  #[test]
  fn test_terminal_states_are_frozen() {
    for terminal in SUCCESSFUL_STATES.iter().chain(FAILED_STATES.iter()) {
      assert!(terminal.transition(CrawlState::Running).is_err());
      assert!(terminal.transition(*terminal).is_ok());
    }
  }

  #[test]
  fn test_running_transitions() {
    assert_eq!(
      CrawlState::Running.transition(CrawlState::Paused).unwrap(),
      CrawlState::Paused
    );
    assert_eq!(
      CrawlState::Paused.transition(CrawlState::Running).unwrap(),
      CrawlState::Running
    );
    assert!(CrawlState::Running.transition(CrawlState::Starting).is_err());
  }

  #[test]
  fn test_stop_reason_terminal_mapping() {
    assert_eq!(
      StopReason::UserStop.successful_state(),
      CrawlState::CompleteUserStop
    );
    assert_eq!(
      StopReason::SizeLimit.successful_state(),
      CrawlState::CompleteSizeLimit
    );
    assert_eq!(
      StopReason::TimeQuota.successful_state(),
      CrawlState::CompleteTimeLimit
    );
  }
}
