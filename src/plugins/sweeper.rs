//! Periodic eviction of activations whose heartbeat lease lapsed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{prelude::*, state::AppState};

pub struct Plugin;

/// One sweep over all licenses; returns how many seats were freed.
pub async fn sweep(app: &AppState) -> Result<u64> {
  let now = app.clock.now();
  let removed = app.sv().activation.sweep(now).await?;
  if removed > 0 {
    info!("Sweep freed {removed} stale seat(s)");
  } else {
    debug!("Sweep found no stale seats");
  }
  Ok(removed)
}

#[async_trait]
impl super::Plugin for Plugin {
  async fn start(
    &self,
    app: Arc<AppState>,
    shutdown: CancellationToken,
  ) -> anyhow::Result<()> {
    let mut interval = time::interval(app.config.sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
      "Sweeping every {}, lease timeout {}",
      humantime::format_duration(app.config.sweep_interval),
      humantime::format_duration(app.config.heartbeat_timeout)
    );

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => {
          info!("Sweeper stopped");
          return Ok(());
        }
        _ = interval.tick() => {}
      }

      // a started sweep always runs to completion
      if let Err(err) = sweep(&app).await {
        error!("Sweep failed: {err}");
      }
    }
  }
}
