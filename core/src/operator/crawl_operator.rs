use super::{
  crawl_channel::{CrawlChannelFactory, CrawlChannel, WorkerHeartbeat},
  mem::{evaluate_memory, MemPolicy},
  models::{
    CrawlJobSpec, CrawlStatus, CustomizeRequest, CustomizeResponse, RelatedResourceRule,
    SyncRequest, SyncResponse, DEFAULT_TTL, EXEC_TIME_UPDATE_SECS, LABEL_CRAWL, METRICS,
    METRICS_API, POD, STARTING_TIME_SECS,
  },
  renderer::{self, RenderParams},
};
use crate::{
  collections::collection_repository::CollectionRepository,
  crawls::{
    crawl::{Crawl, CrawlFile, CrawlState, CrawlStats, CrawlType, StopReason},
    crawl_repository::CrawlRepository,
    page_repository::PageRepository,
  },
  events::{event::Event, event_publisher::EventPublisher},
  helpers::quantity::parse_quantity,
  jobs::background_jobs::BackgroundJobService,
  orgs::{
    exec_seconds::{month_key, split_exec_seconds},
    org::{Organization, StoredBytesKind},
    org_repository::OrgRepository,
  },
  settings::Settings,
  storage::storage_ref::StorageRef,
  workflows::{workflow::Workflow, workflow_repository::WorkflowRepository},
};
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, instrument, warn};

const PAGE_DRAIN_BATCH: usize = 200;
const LOG_DRAIN_BATCH: usize = 50;

const RESYNC_FAST_SECS: f64 = 3.0;
const RESYNC_ACTIVE_SECS: f64 = 10.0;
const RESYNC_IDLE_SECS: f64 = 30.0;

struct ChannelObservation {
  size: u64,
  pages_found: u64,
  heartbeats: BTreeMap<u32, WorkerHeartbeat>,
}

/// Level-triggered reconciler for `CrawlJob.btrix.cloud/v1`. Each sync
/// rebuilds the desired children and the computed status from observed state;
/// nothing is carried in memory between invocations.
pub struct CrawlOperator {
  settings: Arc<Settings>,
  org_repository: Arc<OrgRepository>,
  crawl_repository: Arc<CrawlRepository>,
  workflow_repository: Arc<WorkflowRepository>,
  page_repository: Arc<PageRepository>,
  collection_repository: Arc<CollectionRepository>,
  background_jobs: Arc<BackgroundJobService>,
  event_publisher: Arc<EventPublisher>,
  channel_factory: CrawlChannelFactory,
}

impl CrawlOperator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    settings: Arc<Settings>,
    org_repository: Arc<OrgRepository>,
    crawl_repository: Arc<CrawlRepository>,
    workflow_repository: Arc<WorkflowRepository>,
    page_repository: Arc<PageRepository>,
    collection_repository: Arc<CollectionRepository>,
    background_jobs: Arc<BackgroundJobService>,
    event_publisher: Arc<EventPublisher>,
  ) -> Self {
    let channel_factory = CrawlChannelFactory::new(settings.crawler.namespace.clone());
    Self {
      settings,
      org_repository,
      crawl_repository,
      workflow_repository,
      page_repository,
      collection_repository,
      background_jobs,
      event_publisher,
      channel_factory,
    }
  }

  pub fn customize(&self, request: CustomizeRequest) -> CustomizeResponse {
    let crawl_id = request.parent["spec"]["id"]
      .as_str()
      .unwrap_or_default()
      .to_string();
    CustomizeResponse {
      related_resources: vec![RelatedResourceRule {
        api_version: METRICS_API.to_string(),
        resource: "pods".to_string(),
        label_selector: serde_json::json!({
          "matchLabels": { LABEL_CRAWL: crawl_id }
        }),
      }],
    }
  }

  #[instrument(skip(self, request), fields(crawl_id))]
  pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
    let now = Utc::now();
    let mut status = CrawlStatus::parse_from_parent(&request.parent);

    let spec = match serde_json::from_value::<CrawlJobSpec>(
      request.parent.get("spec").cloned().unwrap_or_default(),
    ) {
      Ok(spec) => spec,
      Err(e) => return Ok(self.fail_permanently(status, &format!("invalid_spec: {}", e), now)),
    };
    tracing::Span::current().record("crawl_id", spec.id.as_str());

    if request.finalizing {
      return self.finalize_deleted(&spec, status, now).await;
    }

    if status.state.is_terminal() {
      return self.sync_terminal(&spec, status, now).await;
    }
    status.resync = false;

    // Infra failures from here on return Err: the meta-controller retries and
    // the previously written status is untouched.
    let org = self.org_repository.get(&spec.oid).await?;
    let workflow = match self.workflow_repository.find(&spec.cid).await? {
      Some(workflow) => workflow,
      None => {
        return Ok(self.fail_permanently(status, "workflow_not_found", now));
      }
    };

    self.ensure_crawl_record(&spec, &workflow, now).await?;
    status.crawler_image = Some(self.settings.crawler.image.clone());

    // Accounting drift does not stop reconciliation: flag it and let the
    // recalculation job repair the counters.
    if org.bytes_stored < 0 {
      error!(
        oid = org.id.to_string(),
        err = crate::errors::ControlPlaneError::AccountingDrift(format!(
          "bytesStored is negative: {}",
          org.bytes_stored
        ))
        .to_string(),
        "Detected org accounting drift"
      );
      self
        .background_jobs
        .enqueue_recalculate_org_stats(org.id)
        .await?;
    }

    // Initial admission happens before any children exist.
    if status.start_time.is_none() {
      if let Some(response) = self.admit(&spec, &org, &mut status, now).await? {
        return Ok(response);
      }
    }

    self.observe_pods(&request, &mut status, now);
    self.observe_metrics(&request, &mut status);

    if status.state == CrawlState::WaitingOrgLimit {
      if self.org_at_concurrency_limit(&org, &spec.id).await? {
        status.last_updated_time = Some(now);
        return Ok(SyncResponse {
          status: serde_json::to_value(&status)?,
          children: Vec::new(),
          resync_after_seconds: Some(RESYNC_IDLE_SECS),
          finalized: None,
        });
      }
      status.state = status.state.transition(CrawlState::WaitingCapacity)?;
      status.start_time = Some(now);
    }

    // Everything observed from the crawl's redis is advisory: when redis is
    // unreachable the operator keeps its last state and asks for a fast
    // resync rather than transitioning on stale data.
    let channel = match self.channel_factory.connect(&spec.id).await {
      Ok(channel) => channel,
      Err(e) => {
        warn!(err = e.to_string(), "Crawl redis unreachable, deferring");
        return self.respond_stale(&spec, &workflow, &org, status).await;
      }
    };
    let observation = match self.observe_channel(&channel, &spec).await {
      Ok(observation) => observation,
      Err(e) => {
        warn!(err = e.to_string(), "Crawl redis read failed, deferring");
        return self.respond_stale(&spec, &workflow, &org, status).await;
      }
    };

    self
      .drain_channel(&channel, &spec, &workflow, &mut status)
      .await?;

    self
      .progress_state(&spec, &org, &workflow, &channel, &observation, &mut status, now)
      .await?;

    self
      .apply_memory_policy(&channel, &mut status)
      .await?;

    if !status.state.is_terminal() {
      self
        .account_exec_seconds(&spec, &org, &channel, &mut status, now)
        .await?;
    }

    if self.should_finalize(&status, &observation) {
      self
        .finalize(&spec, &org, &workflow, &channel, &mut status, now)
        .await?;
    }

    self
      .persist_crawl_progress(&spec, &status, &observation)
      .await?;

    let children = self.render_children(&spec, &workflow, &org, &status)?;
    status.last_updated_time = Some(now);

    let resync = if status.resync {
      RESYNC_FAST_SECS
    } else if status.state.is_running() {
      RESYNC_ACTIVE_SECS
    } else {
      RESYNC_IDLE_SECS
    };

    Ok(SyncResponse {
      status: serde_json::to_value(&status)?,
      children,
      resync_after_seconds: Some(resync),
      finalized: None,
    })
  }

  fn fail_permanently(
    &self,
    mut status: CrawlStatus,
    detail: &str,
    now: DateTime<Utc>,
  ) -> SyncResponse {
    error!(detail, "Marking crawljob permanently failed");
    if !status.state.is_terminal() {
      status.state = CrawlState::Failed;
      status.finished = Some(now);
    }
    status.error_detail = Some(detail.to_string());
    SyncResponse {
      status: serde_json::to_value(&status).unwrap_or_default(),
      children: Vec::new(),
      resync_after_seconds: None,
      finalized: None,
    }
  }

  async fn ensure_crawl_record(
    &self,
    spec: &CrawlJobSpec,
    workflow: &Workflow,
    now: DateTime<Utc>,
  ) -> Result<()> {
    if self.crawl_repository.find(&spec.id).await?.is_some() {
      return Ok(());
    }
    let crawl = Crawl {
      id: spec.id.clone(),
      oid: spec.oid,
      cid: spec.cid,
      userid: spec.userid,
      crawl_type: CrawlType::Crawl,
      started: Some(now),
      state: CrawlState::Starting,
      scheduled: spec.scheduled,
      manual: spec.manual,
      crawler_image: Some(self.settings.crawler.image.clone()),
      ..Default::default()
    };
    self.crawl_repository.put(&crawl).await?;
    info!(crawl_id = spec.id.as_str(), "Crawl record created");
    if let Err(e) = self
      .event_publisher
      .publish(Event::CrawlStarted {
        oid: spec.oid,
        crawl_id: spec.id.clone(),
        cid: workflow.id,
        scheduled: spec.scheduled,
      })
      .await
    {
      warn!(err = e.to_string(), "Failed to publish crawl-started event");
    }
    Ok(())
  }

  async fn org_at_concurrency_limit(&self, org: &Organization, crawl_id: &str) -> Result<bool> {
    if org.quotas.max_concurrent_crawls == 0 {
      return Ok(false);
    }
    let active = self
      .crawl_repository
      .count_active_slots(&org.id, crawl_id)
      .await?;
    Ok(active >= org.quotas.max_concurrent_crawls as usize)
  }

  /// Admission decisions for a crawl that has not started yet: org readOnly,
  /// storage quota, execution-time quota, then the concurrency cap.
  async fn admit(
    &self,
    spec: &CrawlJobSpec,
    org: &Organization,
    status: &mut CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<Option<SyncResponse>> {
    fn skip(
      status: &CrawlStatus,
      state: CrawlState,
      detail: &str,
      now: DateTime<Utc>,
    ) -> Result<Option<SyncResponse>> {
      let mut status = status.clone();
      status.state = state;
      status.finished = Some(now);
      status.error_detail = Some(detail.to_string());
      Ok(Some(SyncResponse {
        status: serde_json::to_value(&status)?,
        children: Vec::new(),
        resync_after_seconds: None,
        finalized: None,
      }))
    }

    if org.read_only {
      let response = skip(status, CrawlState::Failed, "org_readonly", now)?;
      self
        .finish_crawl_record(spec, CrawlState::Failed, None, now)
        .await?;
      return Ok(response);
    }
    if org.storage_quota_reached(0) {
      let response = skip(
        status,
        CrawlState::SkippedStorageQuotaReached,
        "storage_quota_reached",
        now,
      )?;
      self
        .finish_crawl_record(spec, CrawlState::SkippedStorageQuotaReached, None, now)
        .await?;
      return Ok(response);
    }
    if org
      .exec_seconds_remaining(&month_key(now))
      .is_some_and(|remaining| remaining == 0)
    {
      let response = skip(
        status,
        CrawlState::SkippedTimeQuotaReached,
        "time_quota_reached",
        now,
      )?;
      self
        .finish_crawl_record(spec, CrawlState::SkippedTimeQuotaReached, None, now)
        .await?;
      return Ok(response);
    }
    if self.org_at_concurrency_limit(org, &spec.id).await? {
      status.state = CrawlState::WaitingOrgLimit;
      status.last_updated_time = Some(now);
      self
        .crawl_repository
        .update_state(&spec.id, CrawlState::WaitingOrgLimit)
        .await?;
      return Ok(Some(SyncResponse {
        status: serde_json::to_value(&status)?,
        children: Vec::new(),
        resync_after_seconds: Some(RESYNC_IDLE_SECS),
        finalized: None,
      }));
    }

    status.start_time = Some(now);
    Ok(None)
  }

  /// Folds observed pod objects into `podStatus`: allocations from the pod
  /// spec, exit codes and restart markers from container statuses.
  fn observe_pods(&self, request: &SyncRequest, status: &mut CrawlStatus, now: DateTime<Utc>) {
    for (name, pod) in request.children_of_kind(POD) {
      if name.starts_with("redis-") {
        continue;
      }
      let info = status.pod_status.entry(name.clone()).or_default();

      if let Some(requests) = pod["spec"]["containers"][0]["resources"]["requests"].as_object() {
        if let Some(memory) = requests.get("memory").and_then(|q| q.as_str()) {
          info.allocated.memory = parse_quantity(memory).unwrap_or(info.allocated.memory);
        }
        if let Some(cpu) = requests.get("cpu").and_then(|q| q.as_str()) {
          info.allocated.cpu = parse_quantity(cpu).unwrap_or(info.allocated.cpu);
        }
      }

      let container_status = &pod["status"]["containerStatuses"][0];
      let terminated = &container_status["state"]["terminated"];
      if terminated.is_object() {
        let exit_code = terminated["exitCode"].as_i64().map(|code| code as i32);
        info.is_new_exit = exit_code.is_some() && info.exit_code.is_none();
        if info.is_new_exit {
          info.signal_time = Some(now);
        }
        info.exit_code = exit_code;
        info.reason = terminated["reason"].as_str().map(|value| value.to_string());
      } else if container_status["state"]["running"].is_object() {
        info.is_new_exit = false;
        info.exit_code = None;
        info.reason = None;
      }
    }
  }

  fn observe_metrics(&self, request: &SyncRequest, status: &mut CrawlStatus) {
    for (name, metrics) in request.related_of_kind(METRICS) {
      let Some(info) = status.pod_status.get_mut(name) else {
        continue;
      };
      let usage = &metrics["containers"][0]["usage"];
      if let Some(memory) = usage["memory"].as_str() {
        info.used.memory = parse_quantity(memory).unwrap_or(info.used.memory);
      }
      if let Some(cpu) = usage["cpu"].as_str() {
        info.used.cpu = parse_quantity(cpu).unwrap_or(info.used.cpu);
      }
    }
  }

  async fn observe_channel(
    &self,
    channel: &CrawlChannel,
    spec: &CrawlJobSpec,
  ) -> Result<ChannelObservation> {
    let size = channel.total_size().await?;
    let pages_found = channel.pages_found().await?;
    let pod_count = renderer::pod_count(
      spec.browser_windows,
      self.settings.crawler.browsers_per_pod,
    );
    let mut heartbeats = BTreeMap::new();
    for pod_index in 0..pod_count {
      if let Some(heartbeat) = channel.heartbeat(pod_index).await? {
        heartbeats.insert(pod_index, heartbeat);
      }
    }
    Ok(ChannelObservation {
      size,
      pages_found,
      heartbeats,
    })
  }

  /// Moves worker-published pages and logs from redis into the progress store.
  async fn drain_channel(
    &self,
    channel: &CrawlChannel,
    spec: &CrawlJobSpec,
    workflow: &Workflow,
    status: &mut CrawlStatus,
  ) -> Result<()> {
    loop {
      let entries = channel.drain_pages(PAGE_DRAIN_BATCH).await?;
      if entries.is_empty() {
        break;
      }
      let full_batch = entries.len() == PAGE_DRAIN_BATCH;
      let pages = entries
        .into_iter()
        .map(|entry| entry.into_page(spec.oid, &spec.id))
        .collect::<Vec<_>>();
      self.page_repository.put_many(pages).await?;
      if !full_batch {
        break;
      }
    }

    let errors = channel.drain_errors(LOG_DRAIN_BATCH).await?;
    let behavior_logs = channel.drain_behavior_logs(LOG_DRAIN_BATCH).await?;
    if !errors.is_empty() || !behavior_logs.is_empty() {
      self
        .crawl_repository
        .append_logs(&spec.id, &errors, &behavior_logs)
        .await?;
    }

    // Exclusion list is owned by the operator; workers re-read on change.
    if !workflow.exclude.is_empty() && status.start_time.is_some() && status.pages_done == 0 {
      channel.set_exclusions(&workflow.exclude).await?;
    }
    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  async fn progress_state(
    &self,
    spec: &CrawlJobSpec,
    org: &Organization,
    _workflow: &Workflow,
    channel: &CrawlChannel,
    observation: &ChannelObservation,
    status: &mut CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<()> {
    status.size = observation.size;
    status.pages_found = observation.pages_found.max(status.pages_found);
    status.pages_done = observation
      .heartbeats
      .values()
      .map(|heartbeat| heartbeat.pages_done)
      .sum::<u64>()
      .max(status.pages_done);
    for (pod_index, heartbeat) in &observation.heartbeats {
      let name = renderer::pod_name(&spec.id, *pod_index);
      status
        .pod_status
        .entry(name)
        .or_default()
        .worker_state = Some(heartbeat.state.clone());
    }

    // Starting -> running on the first live heartbeat; starting -> waiting
    // when nothing shows up in time.
    if !observation.heartbeats.is_empty() && status.state.is_waiting() {
      status.state = status.state.transition(CrawlState::Running)?;
      self
        .crawl_repository
        .update_state(&spec.id, CrawlState::Running)
        .await?;
    } else if status.state == CrawlState::Starting {
      let waited = status
        .start_time
        .map(|start| (now - start).num_seconds())
        .unwrap_or(0);
      if waited > STARTING_TIME_SECS {
        status.state = status.state.transition(CrawlState::WaitingCapacity)?;
        self
          .crawl_repository
          .update_state(&spec.id, CrawlState::WaitingCapacity)
          .await?;
      }
    }

    // User pause / resume.
    if spec.paused && !status.state.is_paused() && status.state.is_running() {
      channel.set_pause(true).await?;
      status.paused_at = Some(now);
      status.state = status.state.transition(CrawlState::Paused)?;
    } else if !spec.paused && status.state == CrawlState::Paused {
      self.resume(channel, status, CrawlState::Running, now).await?;
    }

    // Quota-pause resume once the triggering quota has slack again.
    if status.state == CrawlState::PausedStorageQuotaReached
      && !org.storage_quota_reached(status.size)
    {
      self.resume(channel, status, CrawlState::Running, now).await?;
    }
    if status.state == CrawlState::PausedTimeQuotaReached
      && org
        .exec_seconds_remaining(&month_key(now))
        .map_or(true, |remaining| remaining > 0)
    {
      self.resume(channel, status, CrawlState::Running, now).await?;
    }

    // A stop request reaches paused crawls too: clear the pause so workers
    // can drain, then stop gracefully.
    if status.state.is_paused() && spec.stopping && status.stop_reason.is_none() {
      status.stop_reason = Some(StopReason::UserStop);
      self.resume(channel, status, CrawlState::Stopping, now).await?;
      channel.request_stop().await?;
    }

    // A pause that outlives the expiry window turns into a graceful stop.
    if status.state.is_paused() {
      let expiry = TimeDelta::minutes(self.settings.operator.paused_expiry_minutes as i64);
      if status
        .paused_at
        .is_some_and(|paused_at| now - paused_at > expiry)
      {
        status.stop_reason = Some(StopReason::PauseExpired);
        self.resume(channel, status, CrawlState::Stopping, now).await?;
        channel.request_stop().await?;
      }
    }

    if status.state.is_running() {
      // User stop.
      if spec.stopping && status.stop_reason.is_none() {
        status.stop_reason = Some(StopReason::UserStop);
        channel.request_stop().await?;
        status.state = status.state.transition(CrawlState::Stopping)?;
      }
      // Size limit.
      if spec.max_crawl_size > 0 && status.size >= spec.max_crawl_size && status.stop_reason.is_none()
      {
        status.stop_reason = Some(StopReason::SizeLimit);
        channel.request_stop().await?;
        status.state = status.state.transition(CrawlState::Stopping)?;
      }
      // Wall-clock limit, excluding paused intervals.
      if spec.timeout > 0
        && status.active_duration_secs(now) >= spec.timeout
        && status.stop_reason.is_none()
      {
        status.stop_reason = Some(StopReason::TimeLimit);
        channel.request_stop().await?;
        status.state = status.state.transition(CrawlState::Stopping)?;
      }
      // Storage quota mid-run pauses rather than stops.
      if status.state == CrawlState::Running && org.storage_quota_reached(status.size) {
        channel.set_pause(true).await?;
        status.paused_at = Some(now);
        status.state = status
          .state
          .transition(CrawlState::PausedStorageQuotaReached)?;
        self
          .crawl_repository
          .update_state(&spec.id, CrawlState::PausedStorageQuotaReached)
          .await?;
      }
    }

    // Worker exits: every pod terminally failed means the crawl failed.
    let pods = status
      .pod_status
      .values()
      .collect::<Vec<_>>();
    if !pods.is_empty()
      && pods
        .iter()
        .all(|pod| pod.exit_code.is_some_and(|code| code != 0))
    {
      status.state = status.state.transition(CrawlState::Failed)?;
      status.finished = Some(now);
      self
        .finish_crawl_record(spec, CrawlState::Failed, status.stop_reason, now)
        .await?;
    }

    Ok(())
  }

  async fn resume(
    &self,
    channel: &CrawlChannel,
    status: &mut CrawlStatus,
    next: CrawlState,
    now: DateTime<Utc>,
  ) -> Result<()> {
    channel.set_pause(false).await?;
    if let Some(paused_at) = status.paused_at.take() {
      status.paused_duration_secs += (now - paused_at).num_seconds().max(0) as u64;
    }
    status.state = status.state.transition(next)?;
    Ok(())
  }

  /// Scale-up on sustained high memory, graceful per-pod stop on soft OOM.
  async fn apply_memory_policy(
    &self,
    channel: &CrawlChannel,
    status: &mut CrawlStatus,
  ) -> Result<()> {
    let mut soft_oom_pods = Vec::new();
    for (name, info) in status.pod_status.iter_mut() {
      if !info.is_alive() {
        continue;
      }
      match evaluate_memory(info.used.memory, info.allocated.memory, info.mem_high) {
        MemPolicy::Ok => info.mem_high = false,
        MemPolicy::High => info.mem_high = true,
        MemPolicy::ScaleUp(new_memory) => {
          info!(pod = name.as_str(), new_memory, "Scaling pod memory up");
          info.new_memory = Some(new_memory);
          info.mem_high = false;
        }
        MemPolicy::SoftOom => {
          if !info.soft_oom {
            warn!(pod = name.as_str(), "Pod at memory allocation, soft OOM");
            info.soft_oom = true;
            if let Some(index) = name.rsplit('-').next().and_then(|s| s.parse::<u32>().ok()) {
              soft_oom_pods.push(index);
            }
          }
        }
      }
    }
    for pod_index in soft_oom_pods {
      channel.request_pod_stop(pod_index).await?;
    }
    Ok(())
  }

  /// Rolls wall-time into the org's execution-second pools, splitting across
  /// monthly/extra/gifted, and pauses the crawl when all pools are dry.
  async fn account_exec_seconds(
    &self,
    spec: &CrawlJobSpec,
    org: &Organization,
    channel: &CrawlChannel,
    status: &mut CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<()> {
    if !status.state.is_running() {
      return Ok(());
    }
    let last = status.last_exec_update.unwrap_or(now);
    let elapsed = (now - last).num_seconds().clamp(0, EXEC_TIME_UPDATE_SECS);
    if status.last_exec_update.is_some() && elapsed < EXEC_TIME_UPDATE_SECS {
      return Ok(());
    }
    status.last_exec_update = Some(now);
    if elapsed == 0 {
      return Ok(());
    }

    let browsers_per_pod = self.settings.crawler.browsers_per_pod;
    let pod_total = renderer::pod_count(spec.browser_windows, browsers_per_pod);
    let mut exec_seconds_delta = 0u64;
    for index in 0..pod_total {
      let name = renderer::pod_name(&spec.id, index);
      let alive = status
        .pod_status
        .get(&name)
        .map(|pod| pod.is_alive())
        .unwrap_or(false);
      if alive {
        let browsers = renderer::browsers_in_pod(spec.browser_windows, browsers_per_pod, index);
        exec_seconds_delta += elapsed as u64 * browsers as u64;
      }
    }
    if exec_seconds_delta == 0 {
      return Ok(());
    }

    let yymm = month_key(now);
    if org.quotas.max_exec_minutes_per_month == 0 {
      // Unmetered orgs still account monthly usage for reporting.
      self
        .org_repository
        .debit_exec_seconds(
          &org.id,
          &yymm,
          &crate::orgs::exec_seconds::DebitSplit {
            monthly: exec_seconds_delta,
            ..Default::default()
          },
        )
        .await?;
      return Ok(());
    }

    let split = split_exec_seconds(&org.exec_pools(&yymm), exec_seconds_delta);
    self
      .org_repository
      .debit_exec_seconds(&org.id, &yymm, &split)
      .await?;

    if split.exhausted() && status.state == CrawlState::Running {
      channel.set_pause(true).await?;
      status.paused_at = Some(now);
      status.state = status.state.transition(CrawlState::PausedTimeQuotaReached)?;
      self
        .crawl_repository
        .update_state(&spec.id, CrawlState::PausedTimeQuotaReached)
        .await?;
    }
    Ok(())
  }

  fn should_finalize(&self, status: &CrawlStatus, observation: &ChannelObservation) -> bool {
    if status.state.is_terminal() || status.finished.is_some() {
      return false;
    }
    if !observation.heartbeats.is_empty()
      && observation
        .heartbeats
        .values()
        .all(|heartbeat| heartbeat.is_finished())
    {
      return true;
    }
    // Heartbeat keys expire shortly after workers exit; clean exits across
    // the board also finalize.
    !status.pod_status.is_empty()
      && status.pod_status.values().all(|pod| pod.exited_cleanly())
  }

  /// Crawl-end bookkeeping: drain the page stream dry, register one
  /// CrawlFile per finalized WACZ, debit storage, enqueue replication, roll
  /// up workflow aggregates, and freeze the terminal state.
  #[allow(clippy::too_many_arguments)]
  async fn finalize(
    &self,
    spec: &CrawlJobSpec,
    org: &Organization,
    workflow: &Workflow,
    channel: &CrawlChannel,
    status: &mut CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<()> {
    loop {
      let entries = channel.drain_pages(PAGE_DRAIN_BATCH).await?;
      if entries.is_empty() {
        break;
      }
      let pages = entries
        .into_iter()
        .map(|entry| entry.into_page(spec.oid, &spec.id))
        .collect::<Vec<_>>();
      self.page_repository.put_many(pages).await?;
    }

    let files = dedupe_finalized_files(channel.finalized_files().await?, &spec.storage_name);

    let files_added_size = files.iter().map(|file| file.size).sum::<u64>();
    status.files_added = files.len() as u64;
    status.files_added_size = files_added_size;

    if !files.is_empty() {
      self.crawl_repository.set_files(&spec.id, &files).await?;
      self
        .org_repository
        .inc_stored_bytes(&spec.oid, StoredBytesKind::Crawls, files_added_size as i64)
        .await?;
      for file in &files {
        for replica in &org.storage_replicas {
          self
            .background_jobs
            .enqueue_create_replica(spec.oid, "crawl", &spec.id, &file.filename, replica.clone())
            .await?;
        }
      }
    }

    let all_done = status
      .pod_status
      .values()
      .filter(|pod| pod.worker_state.is_some())
      .all(|pod| pod.worker_state.as_deref() == Some("done"));
    let state = match (status.stop_reason, all_done, files.is_empty()) {
      (_, _, true) => CrawlState::Failed,
      (Some(reason), _, false) => reason.successful_state(),
      (None, true, false) => CrawlState::Complete,
      (None, false, false) => CrawlState::CompletePartial,
    };

    let counts = self.page_repository.counts_for_crawl(&spec.id).await?;
    self
      .crawl_repository
      .update_page_counts(
        &spec.id,
        counts.total,
        counts.unique_urls,
        counts.files,
        counts.errors,
      )
      .await?;
    self
      .crawl_repository
      .update_stats(
        &spec.id,
        &CrawlStats {
          found: status.pages_found,
          done: status.pages_done,
          size: status.size,
        },
      )
      .await?;

    status.state = status.state.transition(state)?;
    status.finished = Some(now);
    self
      .finish_crawl_record(spec, state, status.stop_reason, now)
      .await?;

    if state.is_successful() {
      for collection_id in &workflow.auto_add_collections {
        if let Err(e) = self
          .collection_repository
          .add_successful_crawl(collection_id, &spec.id, files_added_size, counts.total)
          .await
        {
          warn!(
            collection = collection_id.to_string(),
            err = e.to_string(),
            "Failed to auto-add crawl to collection"
          );
        }
      }
    }

    if let Err(e) = self
      .event_publisher
      .publish(Event::CrawlFinished {
        oid: spec.oid,
        crawl_id: spec.id.clone(),
        cid: workflow.id,
        state,
        files_added: status.files_added,
        files_added_size,
      })
      .await
    {
      warn!(err = e.to_string(), "Failed to publish crawl-finished event");
    }

    info!(
      crawl_id = spec.id.as_str(),
      state = state.as_str(),
      files = status.files_added,
      "Crawl finalized"
    );
    Ok(())
  }

  /// Terminal-state writes to the crawl document and workflow aggregates.
  /// Guarded so a re-reconcile of a terminal crawl never mutates them again.
  async fn finish_crawl_record(
    &self,
    spec: &CrawlJobSpec,
    state: CrawlState,
    stop_reason: Option<StopReason>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let Some(crawl) = self.crawl_repository.find(&spec.id).await? else {
      return Ok(());
    };
    if crawl.finished.is_some() {
      return Ok(());
    }
    self
      .crawl_repository
      .mark_finished(&spec.id, state, now, stop_reason)
      .await?;
    self
      .workflow_repository
      .record_crawl_finished(&spec.cid, &spec.id, state, now, crawl.stats.size)
      .await?;
    Ok(())
  }

  async fn persist_crawl_progress(
    &self,
    spec: &CrawlJobSpec,
    status: &CrawlStatus,
    _observation: &ChannelObservation,
  ) -> Result<()> {
    if status.finished.is_some() {
      return Ok(());
    }
    self
      .crawl_repository
      .update_stats(
        &spec.id,
        &CrawlStats {
          found: status.pages_found,
          done: status.pages_done,
          size: status.size,
        },
      )
      .await?;
    self
      .crawl_repository
      .set_flags(&spec.id, spec.stopping, spec.paused)
      .await?;
    if !status.state.is_terminal() {
      self
        .crawl_repository
        .update_state(&spec.id, status.state)
        .await?;
    }
    Ok(())
  }

  fn render_children(
    &self,
    spec: &CrawlJobSpec,
    workflow: &Workflow,
    org: &Organization,
    status: &CrawlStatus,
  ) -> Result<Vec<serde_json::Value>> {
    if status.state == CrawlState::WaitingOrgLimit {
      return Ok(Vec::new());
    }
    if status.state.is_terminal() {
      return Ok(Vec::new());
    }
    let params = RenderParams {
      spec,
      workflow,
      org,
      status,
      settings: &self.settings.crawler,
      redis_url: self.channel_factory.redis_url(&spec.id),
      store_endpoint: self.settings.operator.app_origin.clone(),
      include_redis: true,
    };
    renderer::render_crawl_children(&params)
  }

  /// Redis was unreachable: keep the last written state, keep children as
  /// they are, and hint an immediate resync. No transitions on stale data.
  async fn respond_stale(
    &self,
    spec: &CrawlJobSpec,
    workflow: &Workflow,
    org: &Organization,
    mut status: CrawlStatus,
  ) -> Result<SyncResponse> {
    status.resync = true;
    let children = self.render_children(spec, workflow, org, &status)?;
    Ok(SyncResponse {
      status: serde_json::to_value(&status)?,
      children,
      resync_after_seconds: Some(RESYNC_FAST_SECS),
      finalized: None,
    })
  }

  /// A finished crawl keeps its children (minus redis) for DEFAULT_TTL
  /// seconds, then everything is garbage-collected.
  async fn sync_terminal(
    &self,
    spec: &CrawlJobSpec,
    mut status: CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<SyncResponse> {
    let finished = *status.finished.get_or_insert(now);
    let age = (now - finished).num_seconds();
    if age >= DEFAULT_TTL {
      return Ok(SyncResponse {
        status: serde_json::to_value(&status)?,
        children: Vec::new(),
        resync_after_seconds: None,
        finalized: None,
      });
    }

    let org = self.org_repository.get(&spec.oid).await?;
    let workflow = self.workflow_repository.get(&spec.cid).await?;
    let params = RenderParams {
      spec,
      workflow: &workflow,
      org: &org,
      status: &status,
      settings: &self.settings.crawler,
      redis_url: self.channel_factory.redis_url(&spec.id),
      store_endpoint: self.settings.operator.app_origin.clone(),
      include_redis: false,
    };
    let children = renderer::render_crawl_children(&params)?;
    Ok(SyncResponse {
      status: serde_json::to_value(&status)?,
      children,
      resync_after_seconds: Some((DEFAULT_TTL - age).max(1) as f64),
      finalized: None,
    })
  }

  /// Finalize hook: the CrawlJob CR is being deleted. An unfinished crawl
  /// becomes `canceled` with no files; children go away immediately.
  async fn finalize_deleted(
    &self,
    spec: &CrawlJobSpec,
    mut status: CrawlStatus,
    now: DateTime<Utc>,
  ) -> Result<SyncResponse> {
    if !status.state.is_terminal() {
      status.state = CrawlState::Canceled;
      status.finished = Some(now);
      self
        .finish_crawl_record(spec, CrawlState::Canceled, None, now)
        .await?;
      info!(crawl_id = spec.id.as_str(), "Crawl canceled on delete");
    }

    if let Ok(channel) = self.channel_factory.connect(&spec.id).await {
      let pod_count = renderer::pod_count(
        spec.browser_windows,
        self.settings.crawler.browsers_per_pod,
      );
      if let Err(e) = channel.clear(pod_count).await {
        warn!(err = e.to_string(), "Failed to clear crawl channel");
      }
    }

    Ok(SyncResponse {
      status: serde_json::to_value(&status)?,
      children: Vec::new(),
      resync_after_seconds: None,
      finalized: Some(true),
    })
  }
}

/// One CrawlFile per distinct WACZ hash; a worker re-announcing the same
/// artifact never registers twice on a crawl.
fn dedupe_finalized_files(
  finalized: Vec<super::crawl_channel::FinalizedFile>,
  storage_name: &str,
) -> Vec<CrawlFile> {
  let mut files: Vec<CrawlFile> = Vec::new();
  for entry in finalized {
    if files.iter().any(|file| file.hash == entry.hash) {
      continue;
    }
    files.push(CrawlFile {
      filename: entry.filename,
      hash: entry.hash,
      size: entry.size,
      storage: StorageRef::new(storage_name.to_string()),
      replicas: Vec::new(),
    });
  }
  files
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::operator::crawl_channel::FinalizedFile;

  fn wacz(filename: &str, hash: &str, size: u64) -> FinalizedFile {
    FinalizedFile {
      filename: filename.to_string(),
      hash: hash.to_string(),
      size,
    }
  }

  #[test]
  fn test_dedupe_finalized_files_by_hash() {
    let files = dedupe_finalized_files(
      vec![
        wacz("crawls/c1-0.wacz", "aa11", 100),
        wacz("crawls/c1-0.wacz", "aa11", 100),
        wacz("crawls/c1-1.wacz", "bb22", 200),
      ],
      "default",
    );
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].filename, "crawls/c1-0.wacz");
    assert_eq!(files[1].hash, "bb22");
    assert!(files.iter().all(|file| file.storage.name == "default"));
  }

  #[test]
  fn test_dedupe_keeps_distinct_hashes_with_same_name() {
    let files = dedupe_finalized_files(
      vec![
        wacz("crawls/c1-0.wacz", "aa11", 100),
        wacz("crawls/c1-0.wacz", "cc33", 150),
      ],
      "default",
    );
    assert_eq!(files.len(), 2);
  }
}
