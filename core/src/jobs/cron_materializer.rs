use crate::{
  context::ApplicationContext,
  job_executor,
  operator::models::CrawlJobSpec,
  scheduler::{
    job_name::JobName,
    scheduler::{JobParametersBuilder, JobProcessorBuilder},
    scheduler_repository::Job,
  },
};
use anyhow::{bail, Result};
use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

const MATERIALIZE_INTERVAL_SECS: i64 = 60;

/// Workflow schedules are five-field cron expressions; the parser wants a
/// seconds field, so firings are pinned to second zero.
pub fn normalize_cron(expr: &str) -> Result<String> {
  let expr = expr.trim();
  match expr.split_whitespace().count() {
    5 => Ok(format!("0 {}", expr)),
    6 | 7 => Ok(expr.to_string()),
    n => bail!("Invalid cron expression ({} fields): {}", n, expr),
  }
}

pub fn next_firing(normalized: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
  Schedule::from_str(normalized).ok()?.after(&after).next()
}

fn schedule_cursor_key(cid: &Uuid) -> String {
  format!("schedule_next:{}", cid)
}

/// Single-writer materializer: walks every scheduled workflow, and at each
/// firing instant creates one CrawlJob through the same admission path as a
/// manual start. Missed firings are not backfilled; only the next upcoming
/// firing is honored.
async fn materialize_scheduled_crawls(_job: Job, ctx: Arc<ApplicationContext>) -> Result<()> {
  let now = Utc::now();
  for workflow in ctx.workflow_repository.list_scheduled().await? {
    let Some(schedule) = workflow.schedule.as_deref() else {
      continue;
    };
    let normalized = match normalize_cron(schedule) {
      Ok(normalized) => normalized,
      Err(e) => {
        warn!(
          cid = workflow.id.to_string(),
          err = e.to_string(),
          "Skipping workflow with invalid schedule"
        );
        continue;
      }
    };

    let cursor_key = schedule_cursor_key(&workflow.id);
    let due: Option<DateTime<Utc>> = ctx.kv.get(&cursor_key).await?;
    match due {
      None => {
        if let Some(next) = next_firing(&normalized, now) {
          ctx.kv.set(&cursor_key, next, None).await?;
        }
      }
      Some(due) if due <= now => {
        if ctx
          .crawl_repository
          .has_active_crawl_for_config(&workflow.id)
          .await?
        {
          warn!(
            cid = workflow.id.to_string(),
            error_detail = "slow_down_too_many_crawls_queued",
            "Rejecting scheduled firing, previous crawl still active"
          );
        } else {
          let spec = CrawlJobSpec {
            id: Uuid::new_v4().to_string(),
            cid: workflow.id,
            oid: workflow.oid,
            userid: None,
            browser_windows: workflow
              .browser_windows
              .max(1)
              .min(ctx.settings.crawler.max_crawl_scale * ctx.settings.crawler.browsers_per_pod),
            timeout: workflow.crawl_timeout as i64,
            max_crawl_size: workflow.max_crawl_size,
            manual: false,
            scheduled: true,
            stopping: false,
            paused: false,
            storage_name: "default".to_string(),
            profile_filename: workflow.profile_filename.clone(),
          };
          match ctx.crawl_job_client.create_crawl_job(&spec).await {
            Ok(()) => {
              info!(
                cid = workflow.id.to_string(),
                crawl_id = spec.id.as_str(),
                firing = due.to_rfc3339(),
                "Materialized scheduled crawl"
              );
            }
            Err(e) => {
              // Leave the cursor in place; the firing retries next tick.
              warn!(
                cid = workflow.id.to_string(),
                err = e.to_string(),
                "Failed to create scheduled CrawlJob"
              );
              continue;
            }
          }
        }
        if let Some(next) = next_firing(&normalized, now) {
          ctx.kv.set(&cursor_key, next, None).await?;
        }
      }
      Some(_) => {}
    }
  }
  Ok(())
}

pub async fn setup_cron_materializer(app_context: Arc<ApplicationContext>) -> Result<()> {
  app_context
    .scheduler
    .register(
      JobProcessorBuilder::default()
        .name(JobName::MaterializeScheduledCrawls)
        .app_context(Arc::clone(&app_context))
        .executor(job_executor!(materialize_scheduled_crawls))
        .build()?,
    )
    .await;

  let interval = TimeDelta::seconds(MATERIALIZE_INTERVAL_SECS);
  app_context
    .scheduler
    .put(
      JobParametersBuilder::default()
        .name(JobName::MaterializeScheduledCrawls)
        .interval(interval)
        .next_execution(Utc::now().naive_utc() + interval)
        .overwrite_existing(false)
        .build()?,
    )
    .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_normalize_cron() {
    assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
    assert_eq!(normalize_cron("0 0 * * * *").unwrap(), "0 0 * * * *");
    assert!(normalize_cron("* *").is_err());
  }

  #[test]
  fn test_next_firing_is_deterministic() {
    let after = Utc.with_ymd_and_hms(2026, 8, 1, 10, 2, 30).unwrap();
    let normalized = normalize_cron("*/5 * * * *").unwrap();
    let first = next_firing(&normalized, after).unwrap();
    let second = next_firing(&normalized, after).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, Utc.with_ymd_and_hms(2026, 8, 1, 10, 5, 0).unwrap());
  }

  #[test]
  fn test_next_firing_skips_missed_instants() {
    // Two hours of downtime produce one upcoming firing, not backfill.
    let after = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 1).unwrap();
    let normalized = normalize_cron("0 * * * *").unwrap();
    let next = next_firing(&normalized, after).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap());
  }
}
