use crate::{
  collections::collection_repository::CollectionRepository,
  crawls::{
    crawl_interactor::CrawlInteractor, crawl_repository::CrawlRepository,
    page_repository::PageRepository,
  },
  events::event_publisher::EventPublisher,
  helpers::{document_store::DocumentStore, key_value_store::KeyValueStore},
  jobs::{background_job_repository::BackgroundJobRepository, background_jobs::BackgroundJobService},
  k8s::crawl_job_client::CrawlJobClient,
  operator::{
    coll_index_operator::CollIndexOperator, crawl_operator::CrawlOperator,
    cron_operator::CronOperator, profile_operator::ProfileOperator,
  },
  orgs::org_repository::OrgRepository,
  redis::build_redis_connection_pool,
  scheduler::scheduler::Scheduler,
  settings::Settings,
  sqlite::SqliteConnection,
  storage::storage_resolver::StorageResolver,
  telemetry::Telemetry,
  workflows::{seed_file_repository::SeedFileRepository, workflow_repository::WorkflowRepository},
};
use anyhow::Result;
use dotenv::dotenv;
use rustis::{bb8::Pool, client::PooledClientManager};
use std::sync::Arc;

pub struct ApplicationContext {
  pub settings: Arc<Settings>,
  pub sqlite_connection: Arc<SqliteConnection>,
  pub kv: Arc<KeyValueStore>,
  pub document_store: Arc<DocumentStore>,
  pub redis_connection_pool: Arc<Pool<PooledClientManager>>,
  pub org_repository: Arc<OrgRepository>,
  pub crawl_repository: Arc<CrawlRepository>,
  pub crawl_interactor: Arc<CrawlInteractor>,
  pub workflow_repository: Arc<WorkflowRepository>,
  pub seed_file_repository: Arc<SeedFileRepository>,
  pub page_repository: Arc<PageRepository>,
  pub collection_repository: Arc<CollectionRepository>,
  pub background_job_repository: Arc<BackgroundJobRepository>,
  pub background_jobs: Arc<BackgroundJobService>,
  pub storage_resolver: Arc<StorageResolver>,
  pub event_publisher: Arc<EventPublisher>,
  pub scheduler: Arc<Scheduler>,
  pub crawl_job_client: Arc<CrawlJobClient>,
  pub crawl_operator: Arc<CrawlOperator>,
  pub profile_operator: Arc<ProfileOperator>,
  pub cron_operator: Arc<CronOperator>,
  pub coll_index_operator: Arc<CollIndexOperator>,
}

impl ApplicationContext {
  pub async fn init() -> Result<Arc<ApplicationContext>> {
    dotenv().ok();
    let settings = Arc::new(Settings::new()?);
    Telemetry::init(&settings.tracing)?;

    let sqlite_connection = Arc::new(SqliteConnection::new(Arc::clone(&settings)).await?);
    let kv = Arc::new(KeyValueStore::new(Arc::clone(&sqlite_connection)));
    let document_store = Arc::new(DocumentStore::new(Arc::clone(&sqlite_connection)));
    let redis_connection_pool =
      Arc::new(build_redis_connection_pool(settings.redis.clone()).await?);

    let org_repository = Arc::new(OrgRepository::new(Arc::clone(&document_store)));
    let crawl_repository = Arc::new(CrawlRepository::new(Arc::clone(&document_store)));
    let workflow_repository = Arc::new(WorkflowRepository::new(Arc::clone(&document_store)));
    let seed_file_repository = Arc::new(SeedFileRepository::new(Arc::clone(&document_store)));
    let page_repository = Arc::new(PageRepository::new(Arc::clone(&document_store)));
    let collection_repository = Arc::new(CollectionRepository::new(Arc::clone(&document_store)));
    let background_job_repository =
      Arc::new(BackgroundJobRepository::new(Arc::clone(&document_store)));

    org_repository.setup_indexes().await?;
    crawl_repository.setup_indexes().await?;
    workflow_repository.setup_indexes().await?;
    seed_file_repository.setup_indexes().await?;
    page_repository.setup_indexes().await?;
    collection_repository.setup_indexes().await?;
    background_job_repository.setup_indexes().await?;

    let storage_resolver = Arc::new(StorageResolver::new(settings.storage.clone()));
    let event_publisher = Arc::new(EventPublisher::new(
      Arc::clone(&redis_connection_pool),
      Arc::clone(&document_store),
    ));
    let scheduler = Arc::new(Scheduler::new(
      Arc::clone(&sqlite_connection),
      Arc::clone(&kv),
    ));
    let background_jobs = Arc::new(BackgroundJobService::new(
      Arc::clone(&background_job_repository),
      Arc::clone(&scheduler),
      settings.jobs.replica_deletion_delay_days,
    ));
    let crawl_job_client = Arc::new(CrawlJobClient::new(&settings)?);
    let crawl_interactor = Arc::new(CrawlInteractor::new(
      Arc::clone(&crawl_repository),
      Arc::clone(&page_repository),
      Arc::clone(&org_repository),
      Arc::clone(&storage_resolver),
      Arc::clone(&background_jobs),
    ));

    let crawl_operator = Arc::new(CrawlOperator::new(
      Arc::clone(&settings),
      Arc::clone(&org_repository),
      Arc::clone(&crawl_repository),
      Arc::clone(&workflow_repository),
      Arc::clone(&page_repository),
      Arc::clone(&collection_repository),
      Arc::clone(&background_jobs),
      Arc::clone(&event_publisher),
    ));
    let profile_operator = Arc::new(ProfileOperator::new(Arc::clone(&settings)));
    let cron_operator = Arc::new(CronOperator::new(Arc::clone(&workflow_repository)));
    let coll_index_operator = Arc::new(CollIndexOperator::new(
      Arc::clone(&settings),
      Arc::clone(&collection_repository),
      Arc::clone(&crawl_repository),
    ));

    Ok(Arc::new(ApplicationContext {
      settings,
      sqlite_connection,
      kv,
      document_store,
      redis_connection_pool,
      org_repository,
      crawl_repository,
      crawl_interactor,
      workflow_repository,
      seed_file_repository,
      page_repository,
      collection_repository,
      background_job_repository,
      background_jobs,
      storage_resolver,
      event_publisher,
      scheduler,
      crawl_job_client,
      crawl_operator,
      profile_operator,
      cron_operator,
      coll_index_operator,
    }))
  }
}
