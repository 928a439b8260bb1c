use super::{
  job_name::JobName,
  scheduler_repository::{Job, SchedulerRepository},
};
use crate::{
  context::ApplicationContext,
  helpers::{async_utils::ThreadSafeAsyncFn, key_value_store::KeyValueStore, priority::Priority},
  sqlite::SqliteConnection,
};
use anyhow::Result;
use chrono::{NaiveDateTime, TimeDelta};
use derive_builder::Builder;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
  spawn,
  sync::{mpsc::unbounded_channel, oneshot, RwLock},
  time::sleep,
};
use tracing::{error, info};

pub enum JobProcessorStatus {
  Running,
  Paused,
}

#[derive(Builder)]
pub struct JobParameters {
  name: JobName,
  #[builder(default, setter(into))]
  id: Option<String>,
  #[builder(default, setter(strip_option))]
  interval: Option<TimeDelta>,
  #[builder(default = "chrono::Utc::now().naive_utc()")]
  next_execution: NaiveDateTime,
  #[builder(default = "true")]
  overwrite_existing: bool,
  #[builder(default, setter(strip_option))]
  payload: Option<Vec<u8>>,
  #[builder(default)]
  priority: Priority,
}

impl From<JobParameters> for Job {
  fn from(params: JobParameters) -> Job {
    Job {
      id: params.id.unwrap_or(params.name.to_string()),
      name: params.name,
      next_execution: params.next_execution,
      last_execution: None,
      interval_seconds: params.interval.map(|d| d.num_seconds() as u32),
      payload: params.payload,
      claimed_at: None,
      priority: params.priority,
      created_at: chrono::Utc::now().naive_utc(),
    }
  }
}

pub struct JobProcessorStatusRepository {
  kv: Arc<KeyValueStore>,
}

impl JobProcessorStatusRepository {
  pub fn new(kv: Arc<KeyValueStore>) -> Self {
    Self { kv }
  }

  fn key(job_name: &JobName) -> String {
    format!("job_processor_paused:{}", job_name)
  }

  pub async fn get(&self, job_name: &JobName) -> Result<JobProcessorStatus> {
    match self.kv.exists(Self::key(job_name)).await? {
      true => Ok(JobProcessorStatus::Paused),
      false => Ok(JobProcessorStatus::Running),
    }
  }

  pub async fn pause(&self, job_name: &JobName, duration: Option<TimeDelta>) -> Result<()> {
    self
      .kv
      .set(
        &Self::key(job_name),
        1,
        duration,
      )
      .await
  }

  pub async fn resume(&self, job_name: &JobName) -> Result<()> {
    self.kv.delete(&Self::key(job_name)).await
  }
}

#[derive(Clone)]
pub struct JobExecutorFn(ThreadSafeAsyncFn<(Job, Arc<ApplicationContext>)>);

#[macro_export]
macro_rules! job_executor {
  ($f: expr) => {{
    fn f(
      (job, app_context): (
        $crate::scheduler::scheduler_repository::Job,
        std::sync::Arc<$crate::context::ApplicationContext>,
      ),
    ) -> impl futures::Future<Output = Result<(), anyhow::Error>> + Send + 'static {
      $f(job, app_context)
    }
    $crate::scheduler::scheduler::JobExecutorFn::new(
      $crate::helpers::async_utils::async_callback(f),
    )
  }};
}

impl JobExecutorFn {
  pub fn new(f: ThreadSafeAsyncFn<(Job, Arc<ApplicationContext>)>) -> Self {
    Self(f)
  }

  async fn execute(&self, mut jobs: Vec<Job>, app_context: Arc<ApplicationContext>) -> Result<()> {
    let Some(job) = jobs.pop() else {
      return Ok(());
    };
    (self.0)((job, app_context)).await
  }
}

#[derive(Builder)]
pub struct JobProcessor {
  pub name: JobName,
  pub app_context: Arc<ApplicationContext>,
  pub executor: JobExecutorFn,
  #[builder(default = "1")]
  pub concurrency: u32,
  #[builder(default = "Duration::from_secs(60)")]
  pub claim_duration: Duration,
  #[builder(default = "Duration::from_secs(1)")]
  pub heartbeat: Duration,
  #[builder(setter(skip), default = "self.get_status_repo()?")]
  pub status_repository: Arc<JobProcessorStatusRepository>,
}

impl JobProcessorBuilder {
  fn get_status_repo(&self) -> Result<Arc<JobProcessorStatusRepository>, String> {
    match &self.app_context {
      Some(app_context) => Ok(Arc::new(JobProcessorStatusRepository::new(Arc::clone(
        &app_context.kv,
      )))),
      None => Err("App context is required".to_string()),
    }
  }
}

impl JobProcessor {
  pub async fn run(&self, scheduler_repository: Arc<SchedulerRepository>) -> Result<()> {
    let (tx, mut rx) = unbounded_channel::<oneshot::Sender<Vec<Job>>>();
    let job_name = self.name.clone();
    let claim_duration = self.claim_duration;
    let repo = Arc::clone(&scheduler_repository);
    spawn(async move {
      while let Some(response_channel) = rx.recv().await {
        let job = repo
          .claim_next_jobs(job_name.clone(), 1, TimeDelta::from_std(claim_duration)?)
          .await?;
        if let Err(j) = response_channel.send(job) {
          error!(message = format!("{:?}", j), "Failed to send job to worker");
        }
      }
      Ok::<_, anyhow::Error>(())
    });

    for _ in 0..self.concurrency {
      let tx = tx.clone();
      let executor = self.executor.clone();
      let app_context = Arc::clone(&self.app_context);
      let heartbeat = self.heartbeat;
      let scheduler_repo = Arc::clone(&scheduler_repository);
      let status_repo = Arc::clone(&self.status_repository);
      let job_name = self.name.clone();

      spawn(async move {
        loop {
          match status_repo.get(&job_name).await {
            Ok(JobProcessorStatus::Paused) => {
              sleep(heartbeat).await;
              continue;
            }
            Err(e) => {
              error!(
                message = e.to_string(),
                "Failed to get job processor status"
              );
              sleep(heartbeat).await;
              continue;
            }
            _ => {}
          }

          let (job_sender, job_receiver) = oneshot::channel();
          if let Err(e) = tx.send(job_sender) {
            error!(message = format!("{:?}", e), "Failed to send claim request");
          }
          match job_receiver.await {
            Ok(jobs) => {
              if !jobs.is_empty() {
                if let Err(e) = executor
                  .execute(jobs.clone(), Arc::clone(&app_context))
                  .await
                {
                  error!(message = e.to_string(), "Failed to execute job");
                }

                if let Err(e) = scheduler_repo.update_jobs_after_execution(jobs).await {
                  error!(
                    message = e.to_string(),
                    "Failed to update jobs after execution"
                  );
                }
              }
            }
            Err(e) => {
              error!(message = e.to_string(), "Failed to receive job");
            }
          }
          sleep(heartbeat).await;
        }
      });
    }
    Ok(())
  }
}

pub struct Scheduler {
  scheduler_repository: Arc<SchedulerRepository>,
  pub processor_registry: Arc<RwLock<HashMap<JobName, JobProcessor>>>,
  processor_status_repository: Arc<JobProcessorStatusRepository>,
}

impl Scheduler {
  pub fn new(sqlite_connection: Arc<SqliteConnection>, kv: Arc<KeyValueStore>) -> Self {
    Self {
      scheduler_repository: Arc::new(SchedulerRepository::new(sqlite_connection)),
      processor_registry: Arc::new(RwLock::new(HashMap::new())),
      processor_status_repository: Arc::new(JobProcessorStatusRepository::new(kv)),
    }
  }

  pub async fn delete_job(&self, job_id: &str) -> Result<()> {
    self.scheduler_repository.delete_job(job_id).await
  }

  pub async fn delete_jobs_by_name(&self, job_name: JobName) -> Result<()> {
    self.scheduler_repository.delete_jobs_by_name(job_name).await
  }

  pub async fn count_jobs_by_name(&self, job_name: JobName) -> Result<usize> {
    self.scheduler_repository.count_jobs_by_name(job_name).await
  }

  pub async fn get_processor_status(&self, job_name: &JobName) -> Result<JobProcessorStatus> {
    self.processor_status_repository.get(job_name).await
  }

  pub async fn pause_processor(
    &self,
    job_name: &JobName,
    duration: Option<TimeDelta>,
  ) -> Result<()> {
    self.processor_status_repository.pause(job_name, duration).await
  }

  pub async fn resume_processor(&self, job_name: &JobName) -> Result<()> {
    self.processor_status_repository.resume(job_name).await
  }

  pub async fn register(&self, processor: JobProcessor) {
    self
      .processor_registry
      .write()
      .await
      .insert(processor.name.clone(), processor);
  }

  pub async fn put(&self, params: JobParameters) -> Result<()> {
    let overwrite_existing = params.overwrite_existing;
    let record: Job = params.into();
    if let Some(existing_job) = self.scheduler_repository.find_job(&record.id).await? {
      let interval_changed = match (record.interval_seconds, existing_job.interval_seconds) {
        (Some(interval_seconds), Some(existing_interval_seconds)) => {
          interval_seconds != existing_interval_seconds
        }
        _ => false,
      };
      // Force overwrite if interval has changed
      if !overwrite_existing && !interval_changed {
        info!(job_id = record.id.as_str(), "Job already exists, skipping");
        return Ok(());
      }
    }
    self.scheduler_repository.put(record).await?;
    Ok(())
  }

  pub async fn run(&self) -> Result<()> {
    let processor_registry = Arc::clone(&self.processor_registry);

    for processor in processor_registry.read().await.values() {
      processor
        .run(Arc::clone(&self.scheduler_repository))
        .await?;
    }

    Ok(())
  }
}
