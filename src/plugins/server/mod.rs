mod handlers;

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
  Router, middleware,
  routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

use crate::{api, prelude::*, state::AppState};

pub struct Plugin;

/// License endpoints behind API-key auth, plus `/health`.
pub fn router(app: Arc<AppState>) -> Router {
  let licenses = Router::new()
    .route(&format!("/{}", api::VALIDATE), post(handlers::validate))
    .route(&format!("/{}", api::ACTIVATE), post(handlers::activate))
    .route(&format!("/{}", api::HEARTBEAT), post(handlers::heartbeat))
    .route(&format!("/{}", api::DISCONNECT), post(handlers::disconnect))
    .route(&format!("/{}", api::REVOKE), post(handlers::revoke))
    .route(&format!("/{}", api::RENEW), post(handlers::renew))
    .route_layer(middleware::from_fn_with_state(
      app.clone(),
      handlers::require_api_key,
    ));

  Router::new()
    .route("/health", get(handlers::health))
    .nest("/api/licenses", licenses)
    .layer(TraceLayer::new_for_http())
    .with_state(app)
}

#[async_trait]
impl super::Plugin for Plugin {
  async fn start(
    &self,
    app: Arc<AppState>,
    shutdown: CancellationToken,
  ) -> anyhow::Result<()> {
    let governor_conf = Arc::new(
      GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(100)
        .finish()
        .context("Failed to build rate limiter config")?,
    );

    let limiter = governor_conf.limiter().clone();

    let port = app.config.port;
    let router = router(app)
      .layer(
        ServiceBuilder::new().layer(GovernorLayer::new(governor_conf)).layer(
          CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        ),
      )
      .into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind {addr}"))?;
    info!("HTTP Server listening on {addr}");

    let limiter = async {
      loop {
        time::sleep(Duration::from_secs(60)).await;
        limiter.retain_recent();
      }
    };

    let server = async {
      axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Axum server error")
    };

    tokio::select! {
      result = server => {
        match &result {
          Ok(_) => info!("Server stopped gracefully"),
          Err(err) => error!("Server stopped with error: {err}"),
        }
        result
      }
      _ = limiter => {
        error!("Rate limiter cleaner stopped unexpectedly!");
        Ok(())
      }
    }
  }
}
