pub mod server;
pub mod sweeper;

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::state::AppState;

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
  fn name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }

  /// Runs until `shutdown` is cancelled. Returning early counts as a crash.
  async fn start(
    &self,
    app: Arc<AppState>,
    shutdown: CancellationToken,
  ) -> anyhow::Result<()>;
}

pub struct App {
  plugins: Vec<Arc<dyn Plugin>>,
  restart_delay: Duration,
}

impl Default for App {
  fn default() -> Self {
    Self::new()
  }
}

impl App {
  pub fn new() -> Self {
    Self { plugins: Vec::new(), restart_delay: Duration::from_secs(5) }
  }

  pub fn register<P: Plugin + 'static>(mut self, plugin: P) -> Self {
    self.plugins.push(Arc::new(plugin));
    self
  }

  pub fn restart_delay(mut self, delay: Duration) -> Self {
    self.restart_delay = delay;
    self
  }

  /// Supervises every plugin, restarting crashed ones, until `shutdown` is
  /// cancelled and all of them have stopped.
  pub async fn run(self, app: Arc<AppState>, shutdown: CancellationToken) {
    let mut set = JoinSet::new();
    let delay = self.restart_delay;

    for plugin in self.plugins {
      let app = app.clone();
      let shutdown = shutdown.clone();

      set.spawn(async move {
        let name = plugin.name();
        info!("SYSTEM: Service `{}` initialized", name);

        loop {
          let handle = tokio::spawn({
            let app = app.clone();
            let plugin = plugin.clone();
            let shutdown = shutdown.clone();
            async move { plugin.start(app, shutdown).await }
          });

          let result = handle.await;
          if shutdown.is_cancelled() {
            info!("Service `{}` shutdown.", name);
            break;
          }

          match result {
            Ok(Ok(())) => {
              warn!("Service `{name}` stopped unexpectedly (Ok).");
            }
            Ok(Err(err)) => {
              error!("Service `{name}` crashed with error: {err:#}.");
            }
            Err(_) => {
              error!("Service `{}` PANICKED!", name);
            }
          }

          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
          }
          info!("SYSTEM: Restarting service `{}`...", name);
        }
      });
    }

    while set.join_next().await.is_some() {}
  }
}
