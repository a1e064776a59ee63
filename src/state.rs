use std::{env, path::PathBuf};

use migration::{Migrator, MigratorTrait};
use sea_orm::ConnectOptions;
use tokio::sync::Mutex;

use crate::{clock::SystemClock, prelude::*, secrets::Secrets, sv};

/// Per-license locks serializing seat accounting.
pub type SeatLocks = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub port: u16,
  pub heartbeat_timeout: Duration,
  pub sweep_interval: Duration,
  pub secrets_path: PathBuf,
  pub secrets_passphrase: String,
  pub api_key: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database_url: String::from("sqlite:licenses.db?mode=rwc"),
      port: 3000,
      heartbeat_timeout: Duration::from_secs(10 * 60),
      sweep_interval: Duration::from_secs(5 * 60),
      secrets_path: PathBuf::from("secrets.bin"),
      secrets_passphrase: String::new(),
      api_key: None,
    }
  }
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
  match env::var(name) {
    Ok(raw) => {
      let duration = humantime::parse_duration(raw.trim()).map_err(|e| {
        Error::InvalidArgument(format!("{name}=`{raw}`: {e}"))
      })?;
      if duration.is_zero() {
        return Err(Error::InvalidArgument(format!("{name} must be positive")));
      }
      Ok(duration)
    }
    Err(_) => Ok(default),
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let default = Self::default();

    let port = match env::var("PORT") {
      Ok(raw) => raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("PORT=`{raw}`")))?,
      Err(_) => default.port,
    };

    let secrets_passphrase = env::var("SECRETS_PASSPHRASE")
      .ok()
      .filter(|p| !p.is_empty())
      .ok_or_else(|| {
        Error::InvalidArgument("SECRETS_PASSPHRASE not set".into())
      })?;

    Ok(Self {
      database_url: env::var("DATABASE_URL").unwrap_or(default.database_url),
      port,
      heartbeat_timeout: duration_var(
        "HEARTBEAT_TIMEOUT",
        default.heartbeat_timeout,
      )?,
      sweep_interval: duration_var("SWEEP_INTERVAL", default.sweep_interval)?,
      secrets_path: env::var("SECRETS_PATH")
        .map(PathBuf::from)
        .unwrap_or(default.secrets_path),
      secrets_passphrase,
      api_key: env::var("API_KEY").ok().filter(|key| !key.trim().is_empty()),
    })
  }
}

pub struct Services<'a> {
  pub license: sv::License<'a>,
  pub activation: sv::Activation<'a>,
}

pub struct AppState {
  pub db: DatabaseConnection,
  pub config: Config,
  pub secrets: Secrets,
  pub clock: Arc<dyn Clock>,
  pub locks: SeatLocks,
}

impl AppState {
  pub async fn new(config: Config, secrets: Secrets) -> Result<Self> {
    info!("Connecting to database...");
    let mut options = ConnectOptions::new(&config.database_url);
    options.sqlx_logging(false);
    if config.database_url.contains(":memory:") {
      options.max_connections(1);
    }
    let db = Database::connect(options).await?;

    info!("Running migrations...");
    Migrator::up(&db, None).await?;

    Ok(Self::with_db(db, config, secrets, Arc::new(SystemClock)))
  }

  pub fn with_db(
    db: DatabaseConnection,
    config: Config,
    secrets: Secrets,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self { db, config, secrets, clock, locks: DashMap::new() }
  }

  pub fn sv(&self) -> Services<'_> {
    Services {
      license: sv::License::new(&self.db, &self.clock, &self.secrets.public_key),
      activation: sv::Activation::new(
        &self.db,
        &self.clock,
        &self.locks,
        self.config.heartbeat_timeout,
      ),
    }
  }
}
