pub mod collections;
pub mod context;
pub mod crawls;
pub mod errors;
pub mod events;
pub mod helpers;
pub mod jobs;
pub mod k8s;
pub mod operator;
pub mod orgs;
pub mod redis;
pub mod scheduler;
pub mod settings;
pub mod sqlite;
pub mod storage;
pub mod telemetry;
pub mod workflows;

use anyhow::Result;
use context::ApplicationContext;
use jobs::{background_jobs::setup_background_jobs, cron_materializer::setup_cron_materializer};
use mimalloc::MiMalloc;
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
  let app_context = ApplicationContext::init().await?;
  info!("Application context initialized");

  setup_background_jobs(Arc::clone(&app_context)).await?;
  setup_cron_materializer(Arc::clone(&app_context)).await?;
  app_context.scheduler.run().await?;

  operator::webhook::run_server(app_context).await
}
