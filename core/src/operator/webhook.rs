use super::models::{CustomizeRequest, SyncRequest, SyncResponse};
use crate::context::ApplicationContext;
use anyhow::Result;
use axum::{
  extract::State,
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

/// Infra failures surface as 500 so the meta-controller retries the sync with
/// the previous status intact.
struct WebhookError(anyhow::Error);

impl IntoResponse for WebhookError {
  fn into_response(self) -> Response {
    error!(err = self.0.to_string(), "Sync hook failed");
    (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
  }
}

impl<E: Into<anyhow::Error>> From<E> for WebhookError {
  fn from(err: E) -> Self {
    Self(err.into())
  }
}

async fn healthz() -> &'static str {
  "ok"
}

async fn sync_crawljobs(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, WebhookError> {
  Ok(Json(ctx.crawl_operator.sync(request).await?))
}

async fn finalize_crawljobs(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(mut request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, WebhookError> {
  request.finalizing = true;
  Ok(Json(ctx.crawl_operator.sync(request).await?))
}

async fn customize_crawljobs(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(request): Json<CustomizeRequest>,
) -> Json<super::models::CustomizeResponse> {
  Json(ctx.crawl_operator.customize(request))
}

async fn sync_profilebrowsers(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, WebhookError> {
  Ok(Json(ctx.profile_operator.sync(request).await?))
}

async fn sync_cronjobs(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, WebhookError> {
  Ok(Json(ctx.cron_operator.sync(request).await?))
}

async fn sync_collindexes(
  State(ctx): State<Arc<ApplicationContext>>,
  Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, WebhookError> {
  Ok(Json(ctx.coll_index_operator.sync(request).await?))
}

pub fn build_router(ctx: Arc<ApplicationContext>) -> Router {
  Router::new()
    .route("/healthz", get(healthz))
    .route("/op/sync/crawljobs", post(sync_crawljobs))
    .route("/op/finalize/crawljobs", post(finalize_crawljobs))
    .route("/op/customize/crawljobs", post(customize_crawljobs))
    .route("/op/sync/profilebrowsers", post(sync_profilebrowsers))
    .route("/op/sync/cronjobs", post(sync_cronjobs))
    .route("/op/sync/collindexes", post(sync_collindexes))
    .with_state(ctx)
}

pub async fn run_server(ctx: Arc<ApplicationContext>) -> Result<()> {
  let port = ctx.settings.operator.webhook_port;
  let app = build_router(ctx);
  let addr = SocketAddr::from(([0, 0, 0, 0], port));
  info!("Operator webhook listening on {}", addr);
  let listener = tokio::net::TcpListener::bind(&addr).await?;
  axum::serve(listener, app).await?;
  Ok(())
}
