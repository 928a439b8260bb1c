use super::{
  background_job::{BackgroundJob, BackgroundJobType},
  background_job_repository::BackgroundJobRepository,
};
use crate::{
  context::ApplicationContext,
  crawls::crawl::{CrawlFile, CrawlType, FileReplica},
  events::{event::Event, event_publisher::EVENTS_COLLECTION},
  helpers::document_store::document_filter::DocumentFilter,
  job_executor,
  orgs::{org::StoredBytesKind, org_repository::StoredBytesTotals},
  scheduler::{
    job_name::JobName,
    scheduler::{JobParametersBuilder, JobProcessorBuilder, Scheduler},
    scheduler_repository::Job,
  },
  storage::storage_ref::StorageRef,
};
use anyhow::{anyhow, Result};
use chrono::{TimeDelta, Utc};
use futures::{pin_mut, StreamExt};
use std::sync::Arc;
use tokio_retry::{strategy::FibonacciBackoff, Retry};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const STREAM_BATCH_SIZE: usize = 100;
const STUCK_JOB_MIN_AGE_DAYS: i64 = 7;

/// Enqueues persisted background jobs and schedules their execution through
/// the shared job processor pool.
pub struct BackgroundJobService {
  repository: Arc<BackgroundJobRepository>,
  scheduler: Arc<Scheduler>,
  replica_deletion_delay_days: u32,
}

impl BackgroundJobService {
  pub fn new(
    repository: Arc<BackgroundJobRepository>,
    scheduler: Arc<Scheduler>,
    replica_deletion_delay_days: u32,
  ) -> Self {
    Self {
      repository,
      scheduler,
      replica_deletion_delay_days,
    }
  }

  #[instrument(skip(self, job))]
  pub async fn enqueue(&self, job: BackgroundJob, delay: Option<TimeDelta>) -> Result<()> {
    self.repository.put(&job).await?;
    self
      .scheduler
      .put(
        JobParametersBuilder::default()
          .name(JobName::ProcessBackgroundJob)
          .id(format!("bgjob:{}", job.id))
          .payload(job.id.as_bytes().to_vec())
          .next_execution(Utc::now().naive_utc() + delay.unwrap_or_else(TimeDelta::zero))
          .build()?,
      )
      .await
  }

  pub async fn enqueue_create_replica(
    &self,
    oid: Uuid,
    object_type: &str,
    object_id: &str,
    file_path: &str,
    replica_storage: StorageRef,
  ) -> Result<()> {
    self
      .enqueue(
        BackgroundJob::create_replica(oid, object_type, object_id, file_path, replica_storage),
        None,
      )
      .await
  }

  /// Replica deletions honor the grace window before touching the object.
  pub async fn enqueue_delete_replica(
    &self,
    oid: Uuid,
    object_type: &str,
    object_id: &str,
    file_path: &str,
    replica_storage: StorageRef,
  ) -> Result<()> {
    self
      .enqueue(
        BackgroundJob::delete_replica(oid, object_type, object_id, file_path, replica_storage),
        Some(TimeDelta::days(self.replica_deletion_delay_days as i64)),
      )
      .await
  }

  pub async fn enqueue_delete_org(&self, oid: Uuid) -> Result<()> {
    self.enqueue(BackgroundJob::delete_org(oid), None).await
  }

  pub async fn enqueue_recalculate_org_stats(&self, oid: Uuid) -> Result<()> {
    self
      .enqueue(BackgroundJob::recalculate_org_stats(oid), None)
      .await
  }

  pub async fn enqueue_re_add_org_pages(&self, oid: Uuid) -> Result<()> {
    self
      .enqueue(BackgroundJob::re_add_org_pages(oid), None)
      .await
  }

  pub fn stuck_job_cutoff_days(&self) -> i64 {
    (self.replica_deletion_delay_days as i64 + 1).max(STUCK_JOB_MIN_AGE_DAYS)
  }
}

async fn process_background_job(job: Job, ctx: Arc<ApplicationContext>) -> Result<()> {
  let id = String::from_utf8(job.payload.ok_or_else(|| anyhow!("Missing payload"))?)?;
  let Some(background_job) = ctx.background_job_repository.find(&id).await? else {
    warn!(job_id = id.as_str(), "Background job document missing");
    return Ok(());
  };
  if background_job.finished.is_some() {
    return Ok(());
  }

  info!(job_id = id.as_str(), job_type = ?background_job.job_type, "Executing background job");
  let outcome = run_background_job(&ctx, &background_job).await;
  match outcome {
    Ok(()) => ctx.background_job_repository.mark_finished(&id, true).await,
    Err(e) => {
      error!(
        job_id = id.as_str(),
        err = e.to_string(),
        "Background job failed"
      );
      ctx.background_job_repository.mark_finished(&id, false).await?;
      // A failed replica copy is a soft error: the primary copy remains and
      // an event goes out, but crawl state is untouched.
      if background_job.job_type == BackgroundJobType::CreateReplica {
        if let (Some(oid), Some(file_path), Some(replica)) = (
          background_job.oid,
          background_job.file_path.clone(),
          background_job.replica_storage.clone(),
        ) {
          if let Err(publish_err) = ctx
            .event_publisher
            .publish(Event::ReplicaJobFailed {
              oid,
              job_id: id.clone(),
              file_path,
              replica_storage: replica.name,
            })
            .await
          {
            warn!(
              err = publish_err.to_string(),
              "Failed to publish replica-job-failed event"
            );
          }
        }
      }
      Ok(())
    }
  }
}

async fn run_background_job(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  match job.job_type {
    BackgroundJobType::CreateReplica => run_create_replica(ctx, job).await,
    BackgroundJobType::DeleteReplica => run_delete_replica(ctx, job).await,
    BackgroundJobType::DeleteOrg => run_delete_org(ctx, job).await,
    BackgroundJobType::RecalculateOrgStats => run_recalculate_org_stats(ctx, job).await,
    BackgroundJobType::ReAddOrgPages => run_re_add_org_pages(ctx, job).await,
    BackgroundJobType::CleanupSeedFiles => cleanup_unreferenced_seed_files(ctx).await,
    BackgroundJobType::OptimizePages | BackgroundJobType::MigrationJob => {
      warn!(job_type = ?job.job_type, "No executor for job type, marking done");
      Ok(())
    }
  }
}

fn required_file_fields(job: &BackgroundJob) -> Result<(Uuid, &str, &str, &StorageRef)> {
  Ok((
    job.oid.ok_or_else(|| anyhow!("Missing oid"))?,
    job
      .object_id
      .as_deref()
      .ok_or_else(|| anyhow!("Missing object_id"))?,
    job
      .file_path
      .as_deref()
      .ok_or_else(|| anyhow!("Missing file_path"))?,
    job
      .replica_storage
      .as_ref()
      .ok_or_else(|| anyhow!("Missing replica_storage"))?,
  ))
}

/// Copies the primary object into the replica bucket and records the replica
/// on the owning file. Safe to re-run: the copy is a put and the record
/// append deduplicates.
async fn run_create_replica(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  let (_, object_id, file_path, replica) = required_file_fields(job)?;
  let crawl = ctx.crawl_repository.get(object_id).await?;
  let file: &CrawlFile = crawl
    .files
    .iter()
    .find(|file| file.filename == file_path)
    .ok_or_else(|| anyhow!("File not found on crawl {}: {}", object_id, file_path))?;

  let store = ctx.storage_resolver.resolve(&file.storage).await?;
  Retry::spawn(FibonacciBackoff::from_millis(500).take(5), || async {
    store
      .copy_to(&file.filename, &replica.name, &file.filename)
      .await
  })
  .await?;

  ctx
    .crawl_repository
    .add_file_replica(
      object_id,
      file_path,
      FileReplica {
        name: replica.name.clone(),
        path: file_path.to_string(),
      },
    )
    .await
}

async fn run_delete_replica(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  let (_, object_id, file_path, replica) = required_file_fields(job)?;
  let store = ctx.storage_resolver.resolve(replica).await?;
  store.delete(file_path).await?;
  // The owning crawl may already be gone during an org cascade.
  if ctx.crawl_repository.find(object_id).await?.is_some() {
    ctx
      .crawl_repository
      .remove_file_replica(object_id, file_path, &replica.name)
      .await?;
  }
  Ok(())
}

/// Org deletion cascade: stop what runs, delete objects and replicas, then
/// remove every document carrying the oid.
async fn run_delete_org(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  let oid = job.oid.ok_or_else(|| anyhow!("Missing oid"))?;

  {
    let stream = ctx.crawl_repository.stream_by_org(&oid, STREAM_BATCH_SIZE);
    pin_mut!(stream);
    while let Some(batch) = stream.next().await {
      for doc in batch? {
        let crawl = doc.document;
        if !crawl.state.is_terminal() {
          if let Err(e) = ctx.crawl_job_client.delete_crawl_job(&crawl.id).await {
            warn!(
              crawl_id = crawl.id.as_str(),
              err = e.to_string(),
              "Failed to delete CrawlJob during org cascade"
            );
          }
        }
        ctx.crawl_interactor.delete_crawl(&crawl.id, false).await?;
      }
    }
  }

  for seed_file in ctx.seed_file_repository.list().await? {
    if seed_file.oid != oid {
      continue;
    }
    if let Some(org) = ctx.org_repository.find(&oid).await? {
      let store = ctx.storage_resolver.resolve(&org.storage).await?;
      if let Err(e) = store.delete(&seed_file.filename).await {
        warn!(
          file = seed_file.filename.as_str(),
          err = e.to_string(),
          "Failed to delete seed file object"
        );
      }
    }
  }

  ctx.page_repository.delete_by_org(&oid).await?;
  ctx.crawl_repository.delete_by_org(&oid).await?;
  ctx.workflow_repository.delete_by_org(&oid).await?;
  ctx.collection_repository.delete_by_org(&oid).await?;
  ctx.seed_file_repository.delete_by_org(&oid).await?;
  ctx
    .background_job_repository
    .delete_by_org_except(&oid, &job.id)
    .await?;
  let mut events_filter = DocumentFilter::new();
  events_filter.condition("oid", "=", oid.to_string());
  ctx
    .document_store
    .delete_matching(EVENTS_COLLECTION, events_filter.build())
    .await?;
  ctx.org_repository.delete(&oid).await?;
  info!(oid = oid.to_string(), "Organization deleted");
  Ok(())
}

/// Recomputes `bytesStored*` from the documents that own files. Idempotent.
async fn run_recalculate_org_stats(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  let oid = job.oid.ok_or_else(|| anyhow!("Missing oid"))?;
  let mut totals = StoredBytesTotals::default();

  {
    let stream = ctx.crawl_repository.stream_by_org(&oid, STREAM_BATCH_SIZE);
    pin_mut!(stream);
    while let Some(batch) = stream.next().await {
      for doc in batch? {
        let crawl = doc.document;
        let size = crawl.files.iter().map(|file| file.size).sum::<u64>() as i64;
        match crawl.crawl_type {
          CrawlType::Crawl | CrawlType::Qa => totals.crawls += size,
          CrawlType::Upload => totals.uploads += size,
        }
      }
    }
  }

  for seed_file in ctx.seed_file_repository.list().await? {
    if seed_file.oid == oid {
      totals.seed_files += seed_file.size as i64;
    }
  }

  ctx.org_repository.set_stored_bytes(&oid, totals).await?;
  info!(oid = oid.to_string(), "Org storage stats recalculated");
  Ok(())
}

/// Re-derives per-crawl page aggregates from the pages collection.
async fn run_re_add_org_pages(ctx: &Arc<ApplicationContext>, job: &BackgroundJob) -> Result<()> {
  let oid = job.oid.ok_or_else(|| anyhow!("Missing oid"))?;
  let stream = ctx.crawl_repository.stream_by_org(&oid, STREAM_BATCH_SIZE);
  pin_mut!(stream);
  while let Some(batch) = stream.next().await {
    for doc in batch? {
      let crawl = doc.document;
      let counts = ctx.page_repository.counts_for_crawl(&crawl.id).await?;
      ctx
        .crawl_repository
        .update_page_counts(
          &crawl.id,
          counts.total,
          counts.unique_urls,
          counts.files,
          counts.errors,
        )
        .await?;
    }
  }
  Ok(())
}

/// Periodic sweep deleting seed files no workflow references anymore.
async fn cleanup_unreferenced_seed_files(ctx: &Arc<ApplicationContext>) -> Result<()> {
  for seed_file in ctx.seed_file_repository.list().await? {
    let references = ctx
      .workflow_repository
      .count_referencing_seed_file(&seed_file.id)
      .await?;
    if references > 0 {
      continue;
    }
    if let Some(org) = ctx.org_repository.find(&seed_file.oid).await? {
      let store = ctx.storage_resolver.resolve(&org.storage).await?;
      if let Err(e) = store.delete(&seed_file.filename).await {
        warn!(
          file = seed_file.filename.as_str(),
          err = e.to_string(),
          "Failed to delete seed file object"
        );
        continue;
      }
      ctx
        .org_repository
        .inc_stored_bytes(&seed_file.oid, StoredBytesKind::SeedFiles, -(seed_file.size as i64))
        .await?;
    }
    ctx.seed_file_repository.delete(&seed_file.id).await?;
    info!(
      seed_file = seed_file.id.to_string(),
      "Unreferenced seed file removed"
    );
  }
  Ok(())
}

async fn cleanup_seed_files_job(_job: Job, ctx: Arc<ApplicationContext>) -> Result<()> {
  cleanup_unreferenced_seed_files(&ctx).await
}

/// Jobs stuck unfinished past the cutoff are marked failed so they become
/// retryable.
async fn recover_stuck_jobs(_job: Job, ctx: Arc<ApplicationContext>) -> Result<()> {
  let cutoff = Utc::now() - TimeDelta::days(ctx.background_jobs.stuck_job_cutoff_days());
  for stuck in ctx.background_job_repository.list_stuck(cutoff).await? {
    warn!(job_id = stuck.id.as_str(), "Marking stuck background job failed");
    ctx
      .background_job_repository
      .mark_finished(&stuck.id, false)
      .await?;
  }
  Ok(())
}

pub async fn setup_background_jobs(app_context: Arc<ApplicationContext>) -> Result<()> {
  app_context
    .scheduler
    .register(
      JobProcessorBuilder::default()
        .name(JobName::ProcessBackgroundJob)
        .app_context(Arc::clone(&app_context))
        .executor(job_executor!(process_background_job))
        .concurrency(app_context.settings.jobs.concurrency)
        .build()?,
    )
    .await;

  app_context
    .scheduler
    .register(
      JobProcessorBuilder::default()
        .name(JobName::CleanupSeedFiles)
        .app_context(Arc::clone(&app_context))
        .executor(job_executor!(cleanup_seed_files_job))
        .build()?,
    )
    .await;

  app_context
    .scheduler
    .register(
      JobProcessorBuilder::default()
        .name(JobName::RecoverStuckJobs)
        .app_context(Arc::clone(&app_context))
        .executor(job_executor!(recover_stuck_jobs))
        .build()?,
    )
    .await;

  let daily = TimeDelta::days(1);
  app_context
    .scheduler
    .put(
      JobParametersBuilder::default()
        .name(JobName::CleanupSeedFiles)
        .interval(daily)
        .next_execution(Utc::now().naive_utc() + daily)
        .overwrite_existing(false)
        .build()?,
    )
    .await?;

  let hourly = TimeDelta::hours(1);
  app_context
    .scheduler
    .put(
      JobParametersBuilder::default()
        .name(JobName::RecoverStuckJobs)
        .interval(hourly)
        .next_execution(Utc::now().naive_utc() + hourly)
        .overwrite_existing(false)
        .build()?,
    )
    .await?;

  Ok(())
}
