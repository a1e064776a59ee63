use std::sync::Arc;

use license_vault::{
  plugins::{App, server, sweeper},
  prelude::*,
  secrets::Secrets,
  state::{AppState, Config},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
  EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
      "license_vault=debug,tower_http=debug,sea_orm=warn".into()
    }))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = Config::from_env().context("Invalid configuration")?;
  info!("Starting License Vault v{}", env!("CARGO_PKG_VERSION"));

  let secrets = Secrets::load_or_generate(
    &config.secrets_path,
    &config.secrets_passphrase,
    config.api_key.clone(),
  )
  .await
  .context("Failed to load server keys")?;

  let app = Arc::new(AppState::new(config, secrets).await?);

  let shutdown = CancellationToken::new();
  tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
      }
      info!("Shutdown signal received");
      shutdown.cancel();
    }
  });

  App::new()
    .register(server::Plugin)
    .register(sweeper::Plugin)
    .run(app, shutdown)
    .await;

  Ok(())
}
