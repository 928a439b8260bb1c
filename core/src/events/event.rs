use crate::crawls::crawl::CrawlState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound notification events. Consumers (webhook senders) drain these from
/// the notification list; the control plane only records and enqueues.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
  CrawlStarted {
    oid: Uuid,
    crawl_id: String,
    cid: Uuid,
    scheduled: bool,
  },
  CrawlFinished {
    oid: Uuid,
    crawl_id: String,
    cid: Uuid,
    state: CrawlState,
    files_added: u64,
    files_added_size: u64,
  },
  ReplicaJobFailed {
    oid: Uuid,
    job_id: String,
    file_path: String,
    replica_storage: String,
  },
}

impl Event {
  pub fn oid(&self) -> Uuid {
    match self {
      Event::CrawlStarted { oid, .. } => *oid,
      Event::CrawlFinished { oid, .. } => *oid,
      Event::ReplicaJobFailed { oid, .. } => *oid,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_event_wire_shape() {
    let event = Event::ReplicaJobFailed {
      oid: Uuid::new_v4(),
      job_id: "j1".to_string(),
      file_path: "crawls/c1/data.wacz".to_string(),
      replica_storage: "backup".to_string(),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "replica-job-failed");
    assert_eq!(value["data"]["job_id"], "j1");
  }
}
