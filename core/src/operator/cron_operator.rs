use super::models::{SyncRequest, SyncResponse, LABEL_CRAWLCONFIG};
use crate::jobs::cron_materializer::{next_firing, normalize_cron};
use crate::workflows::workflow_repository::WorkflowRepository;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Decorator sync for `CronJob` resources labeled `btrix.crawlconfig`. The
/// single-writer materializer owns CrawlJob creation; this hook only reports
/// the schedule the workflow currently carries so drift is visible, and
/// attaches no children.
pub struct CronOperator {
  workflow_repository: Arc<WorkflowRepository>,
}

impl CronOperator {
  pub fn new(workflow_repository: Arc<WorkflowRepository>) -> Self {
    Self { workflow_repository }
  }

  #[instrument(skip(self, request))]
  pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
    let cid = request.parent["metadata"]["labels"][LABEL_CRAWLCONFIG]
      .as_str()
      .and_then(|value| Uuid::parse_str(value).ok());

    let mut status = serde_json::json!({ "suspend": true });
    if let Some(cid) = cid {
      if let Some(workflow) = self.workflow_repository.find(&cid).await? {
        if let Some(schedule) = workflow.schedule.as_deref() {
          status["schedule"] = serde_json::json!(schedule);
          if let Ok(normalized) = normalize_cron(schedule) {
            if let Some(next) = next_firing(&normalized, Utc::now()) {
              status["nextFiring"] = serde_json::json!(next);
            }
          }
        }
      }
    }

    Ok(SyncResponse {
      status,
      children: Vec::new(),
      resync_after_seconds: Some(60.0),
      finalized: request.finalizing.then_some(true),
    })
  }
}
