//! Client-side license session.
//!
//! A [`Session`] holds at most one current license. Loading verifies the
//! container, validates it offline or against the license server, and for
//! concurrent licenses keeps the seat leased with a background heartbeat
//! until [`Session::close`].

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  api::{self, Res, SeatReq, SeatRes, ValidateReq},
  clock::SystemClock,
  codec,
  device::{DeviceId, MachineFingerprint},
  model::{Kind, License, LicenseType},
  prelude::*,
  validator::{Failure, Params, Validator, keys},
};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000/api/licenses";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
  Online,
  #[default]
  Offline,
}

/// Outcome of the most recent heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HeartbeatStatus {
  #[default]
  Idle,
  Alive { at: DateTime<Utc> },
  Failed { at: DateTime<Utc>, error: String },
}

enum CallError {
  /// The request never produced a usable answer.
  Transport(String),
  /// The server answered and said no.
  Rejected(String),
}

impl CallError {
  fn into_text(self) -> String {
    match self {
      CallError::Transport(text) | CallError::Rejected(text) => text,
    }
  }

  fn remote(self) -> Error {
    Error::RemoteCallFailed(self.into_text())
  }
}

#[derive(Clone)]
struct Remote {
  client: reqwest::Client,
  endpoint: String,
  api_key: Option<String>,
}

impl Remote {
  async fn post<B, T>(&self, action: &str, body: &B) -> Result<T, CallError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let url = format!("{}/{action}", self.endpoint);
    let mut req = self.client.post(&url).json(body);
    if let Some(key) = &self.api_key {
      req = req.bearer_auth(key);
    }

    let res = req
      .send()
      .await
      .map_err(|e| CallError::Transport(format!("{url}: {e}")))?;
    let status = res.status();
    let text = res
      .text()
      .await
      .map_err(|e| CallError::Transport(format!("{url}: {e}")))?;

    match json::from_str::<Res<T>>(&text) {
      Ok(Res { success: true, data: Some(data), .. }) if status.is_success() => {
        Ok(data)
      }
      Ok(Res { error: Some(error), .. }) => Err(CallError::Rejected(error)),
      Ok(_) if status.is_success() => {
        Err(CallError::Transport(format!("{url}: empty response")))
      }
      _ if status.is_success() => {
        Err(CallError::Transport(format!("{url}: malformed response")))
      }
      _ => Err(CallError::Rejected(format!("{status}: {}", text.trim()))),
    }
  }
}

struct Heartbeat {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

pub struct Session {
  public_key: VerifyingKey,
  machine_id: String,
  remote: Remote,
  heartbeat_interval: Duration,
  clock: Arc<dyn Clock>,
  validator: Validator,
  current: Option<License>,
  heartbeat: Option<Heartbeat>,
  status: watch::Sender<HeartbeatStatus>,
}

impl Session {
  pub fn new(public_key: VerifyingKey) -> Self {
    let machine_id = MachineFingerprint
      .device_id()
      .unwrap_or_else(|_| Uuid::new_v4().to_string());
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .unwrap_or_default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    Self {
      public_key,
      machine_id,
      remote: Remote {
        client,
        endpoint: DEFAULT_ENDPOINT.to_string(),
        api_key: None,
      },
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      validator: Validator::new(clock.clone()),
      clock,
      current: None,
      heartbeat: None,
      status: watch::Sender::new(HeartbeatStatus::Idle),
    }
  }

  pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
    self.remote.api_key = Some(api_key.into());
    self
  }

  pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
    self.machine_id = machine_id.into();
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.validator = Validator::new(clock.clone());
    self.clock = clock;
    self
  }

  /// Replaces the offline validator, e.g. to add rule groups.
  pub fn with_validator(mut self, validator: Validator) -> Self {
    self.validator = validator;
    self
  }

  pub fn set_server_endpoint(&mut self, url: &str) -> Result<()> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
      return Err(Error::InvalidArgument("server endpoint is empty".into()));
    }

    let parsed = reqwest::Url::parse(url)
      .map_err(|e| Error::InvalidArgument(format!("server endpoint: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(Error::InvalidArgument(format!(
        "unsupported endpoint scheme `{}`",
        parsed.scheme()
      )));
    }

    self.remote.endpoint = url.to_string();
    Ok(())
  }

  pub fn set_heartbeat_interval(&mut self, interval: Duration) -> Result<()> {
    if interval.is_zero() {
      return Err(Error::InvalidArgument(
        "heartbeat interval must be positive".into(),
      ));
    }
    self.heartbeat_interval = interval;
    Ok(())
  }

  pub fn endpoint(&self) -> &str {
    &self.remote.endpoint
  }

  pub fn heartbeat_interval(&self) -> Duration {
    self.heartbeat_interval
  }

  pub fn machine_id(&self) -> &str {
    &self.machine_id
  }

  pub fn license(&self) -> Option<&License> {
    self.current.as_ref()
  }

  pub fn is_heartbeat_running(&self) -> bool {
    self.heartbeat.as_ref().is_some_and(|hb| !hb.handle.is_finished())
  }

  /// Watches the outcome of heartbeats of the current license.
  pub fn heartbeat_status(&self) -> watch::Receiver<HeartbeatStatus> {
    self.status.subscribe()
  }

  /// Packs `license` and writes the container to `path` when given.
  pub async fn save(
    license: &License,
    private_key: &SigningKey,
    path: Option<&Path>,
  ) -> Result<Vec<u8>> {
    let bytes = codec::pack(license, private_key)?;
    if let Some(path) = path {
      tokio::fs::write(path, &bytes).await?;
      info!("License {} saved to {}", license.license_key(), path.display());
    }
    Ok(bytes)
  }

  pub async fn load_file(
    &mut self,
    path: impl AsRef<Path>,
    mode: ValidationMode,
    params: Option<&Params>,
  ) -> Result<&License> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    self.load(&bytes, mode, params).await
  }

  /// Verifies and validates a container and makes it the current license.
  ///
  /// Parameters the license derives for itself are used where `params`
  /// leaves gaps; a node-locked license is checked against this session's
  /// machine id. On any failure the previous state is kept.
  pub async fn load(
    &mut self,
    bytes: &[u8],
    mode: ValidationMode,
    params: Option<&Params>,
  ) -> Result<&License> {
    let license = codec::verify_and_open(bytes, &self.public_key)?;

    let mut derived = Params::from_license(&license);
    if let Kind::NodeLocked { .. } = license.kind() {
      derived.insert(keys::HARDWARE_ID, self.machine_id.as_str());
    }
    let params = match params {
      Some(params) => derived.merge(params),
      None => derived,
    };

    match mode {
      ValidationMode::Offline => self.validator.validate(&license, &params)?,
      ValidationMode::Online => {
        self.validate_online(&license, bytes, &params).await?
      }
    }

    if self.current.is_some()
      && let Err(err) = self.close().await
    {
      warn!("Previous license was not released cleanly: {err}");
    }

    info!(
      "Loaded {:?} license {} ({mode:?})",
      license.license_type(),
      license.license_key()
    );
    if license.license_type() == LicenseType::Concurrent {
      self.start_heartbeat(license.license_key().to_string());
    }

    Ok(&*self.current.insert(license))
  }

  async fn validate_online(
    &self,
    license: &License,
    bytes: &[u8],
    params: &Params,
  ) -> Result<()> {
    let req = ValidateReq {
      license_key: license.license_key().to_string(),
      params: params.clone(),
      container: BASE64.encode(bytes),
    };

    match self.remote.post::<_, json::Value>(api::VALIDATE, &req).await {
      Ok(_) => Ok(()),
      Err(CallError::Rejected(text)) => {
        Err(Error::ValidationFailed(Failure::Remote(text)))
      }
      Err(err) => Err(err.remote()),
    }
  }

  fn current(&self) -> &License {
    match &self.current {
      Some(license) => license,
      None => panic!("no license loaded, call `Session::load` first"),
    }
  }

  /// # Panics
  ///
  /// Panics when no license is loaded.
  pub fn is_feature_enabled(&self, name: &str) -> bool {
    self.current().is_feature_enabled(name)
  }

  /// # Panics
  ///
  /// Panics when no license is loaded.
  pub fn require_feature(&self, name: &str) -> Result<()> {
    if self.current().is_feature_enabled(name) {
      Ok(())
    } else {
      Err(Error::FeatureNotLicensed(name.to_string()))
    }
  }

  fn start_heartbeat(&mut self, license_key: String) {
    let token = CancellationToken::new();
    let remote = self.remote.clone();
    let clock = self.clock.clone();
    let status = self.status.clone();
    let interval = self.heartbeat_interval;
    let req = SeatReq { license_key, machine_id: self.machine_id.clone() };

    let handle = tokio::spawn({
      let token = token.clone();
      async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
          }

          let result = tokio::select! {
            _ = token.cancelled() => break,
            result = remote.post::<_, SeatRes>(api::HEARTBEAT, &req) => result,
          };

          let at = clock.now();
          match result {
            Ok(_) => {
              debug!("Heartbeat for {} acknowledged", req.license_key);
              status.send_replace(HeartbeatStatus::Alive { at });
            }
            Err(err) => {
              let error = err.into_text();
              warn!("Heartbeat for {} failed: {error}", req.license_key);
              status.send_replace(HeartbeatStatus::Failed { at, error });
            }
          }
        }
      }
    });

    self.heartbeat = Some(Heartbeat { token, handle });
  }

  async fn stop_heartbeat(&mut self) {
    if let Some(Heartbeat { token, handle }) = self.heartbeat.take() {
      token.cancel();
      if let Err(err) = handle.await
        && err.is_panic()
      {
        error!("Heartbeat task panicked");
      }
      self.status.send_replace(HeartbeatStatus::Idle);
    }
  }

  /// Stops the heartbeat, releases the seat of a concurrent license and
  /// clears the current license. Calling it again is a no-op.
  ///
  /// State is cleared even when the release call fails; the error is
  /// returned for the caller to report.
  pub async fn close(&mut self) -> Result<()> {
    self.stop_heartbeat().await;

    let Some(license) = self.current.take() else {
      return Ok(());
    };

    if license.license_type() == LicenseType::Concurrent {
      let req = SeatReq {
        license_key: license.license_key().to_string(),
        machine_id: self.machine_id.clone(),
      };
      if let Err(err) = self.remote.post::<_, bool>(api::DISCONNECT, &req).await {
        let err = err.remote();
        warn!("Disconnect of {} failed: {err}", license.license_key());
        return Err(err);
      }
      debug!("Seat of {} released", license.license_key());
    }

    Ok(())
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    if let Some(heartbeat) = &self.heartbeat {
      heartbeat.token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;

  use tokio::net::TcpListener;

  use super::*;
  use crate::{
    clock::ManualClock, crypto, generator::Generator, plugins::server,
    state::{AppState, testing},
  };

  async fn serve(app: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, server::router(app)).await.unwrap();
    });
    addr
  }

  async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/api/licenses")
  }

  struct Fixture {
    app: Arc<AppState>,
    session: Session,
  }

  async fn fixture() -> Fixture {
    let app = Arc::new(testing::state(Arc::new(ManualClock::default())).await);
    let addr = serve(app.clone()).await;

    let mut session = Session::new(app.secrets.public_key)
      .with_api_key(app.secrets.api_key.clone())
      .with_machine_id("M1");
    session.set_server_endpoint(&format!("http://{addr}/api/licenses/")).unwrap();

    Fixture { app, session }
  }

  fn pack(app: &AppState, license: &License) -> Vec<u8> {
    codec::pack(license, &app.secrets.private_key).unwrap()
  }

  async fn wait_for<F>(mut rx: watch::Receiver<HeartbeatStatus>, f: F) -> HeartbeatStatus
  where
    F: Fn(&HeartbeatStatus) -> bool,
  {
    let status = time::timeout(Duration::from_secs(10), rx.wait_for(|s| f(s)))
      .await
      .expect("heartbeat status never changed")
      .unwrap();
    status.clone()
  }

  #[tokio::test]
  async fn offline_load_uses_derived_params_and_features() {
    let mut fx = fixture().await;
    let license = Generator::default()
      .standard("Alice")
      .with_feature("Export", true)
      .with_feature("Print", false);
    let bytes = pack(&fx.app, &license);

    let loaded = fx.session.load(&bytes, ValidationMode::Offline, None).await.unwrap();
    assert_eq!(loaded, &license);

    assert!(fx.session.is_feature_enabled("Export"));
    assert!(!fx.session.is_feature_enabled("Print"));
    assert!(fx.session.require_feature("Export").is_ok());
    assert!(matches!(
      fx.session.require_feature("Import"),
      Err(Error::FeatureNotLicensed(name)) if name == "Import"
    ));
    assert!(!fx.session.is_heartbeat_running());
  }

  #[tokio::test]
  async fn failed_load_keeps_previous_license() {
    let mut fx = fixture().await;
    let first = Generator::default().standard("Alice");
    fx.session
      .load(&pack(&fx.app, &first), ValidationMode::Offline, None)
      .await
      .unwrap();

    let mut tampered = pack(&fx.app, &Generator::default().standard("Bob"));
    let at = tampered.len() - 40;
    tampered[at] ^= 0x01;
    assert!(matches!(
      fx.session.load(&tampered, ValidationMode::Offline, None).await,
      Err(Error::InvalidFormat)
    ));

    let wrong = Params::new().with(keys::USER_NAME, "Mallory");
    let second = pack(&fx.app, &Generator::default().standard("Bob"));
    assert!(matches!(
      fx.session.load(&second, ValidationMode::Offline, Some(&wrong)).await,
      Err(Error::ValidationFailed(Failure::Mismatch(_)))
    ));

    assert_eq!(fx.session.license(), Some(&first));
  }

  #[tokio::test]
  async fn zero_period_trial_is_expired_on_load() {
    let mut fx = fixture().await;
    let trial = Generator::default().trial(Duration::ZERO);

    assert!(matches!(
      fx.session.load(&pack(&fx.app, &trial), ValidationMode::Offline, None).await,
      Err(Error::Expired)
    ));
    assert!(fx.session.license().is_none());
  }

  #[tokio::test]
  #[should_panic(expected = "no license loaded")]
  async fn feature_lookup_without_license_panics() {
    let (_, public) = crypto::generate_keypair();
    Session::new(public).is_feature_enabled("Export");
  }

  #[tokio::test]
  async fn online_load_defers_to_server() {
    let mut fx = fixture().await;
    let license = Generator::default().node_locked(Some("M1")).unwrap();
    fx.app.sv().license.register(&license).await.unwrap();
    let bytes = pack(&fx.app, &license);

    fx.session.load(&bytes, ValidationMode::Online, None).await.unwrap();

    let wrong = Params::new().with(keys::HARDWARE_ID, "HW-999");
    let err = fx
      .session
      .load(&bytes, ValidationMode::Online, Some(&wrong))
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      Error::ValidationFailed(Failure::Remote(text)) if text.contains("HardwareId")
    ));

    let unregistered = pack(&fx.app, &Generator::default().standard("Eve"));
    assert!(matches!(
      fx.session.load(&unregistered, ValidationMode::Online, None).await,
      Err(Error::ValidationFailed(Failure::Remote(_)))
    ));
  }

  #[tokio::test]
  async fn node_locked_license_is_bound_to_session_machine() {
    let mut fx = fixture().await;
    let generator = Generator::default();

    let elsewhere = pack(&fx.app, &generator.node_locked(Some("HW-123")).unwrap());
    assert!(matches!(
      fx.session.load(&elsewhere, ValidationMode::Offline, None).await,
      Err(Error::ValidationFailed(Failure::Mismatch(key))) if key == keys::HARDWARE_ID
    ));
    assert!(fx.session.license().is_none());

    let here = generator.node_locked(Some("M1")).unwrap();
    let loaded = fx
      .session
      .load(&pack(&fx.app, &here), ValidationMode::Offline, None)
      .await
      .unwrap();
    assert_eq!(loaded, &here);
  }

  #[tokio::test]
  async fn unreachable_server_is_remote_call_failure() {
    let mut fx = fixture().await;
    fx.session.set_server_endpoint(&dead_endpoint().await).unwrap();
    let bytes = pack(&fx.app, &Generator::default().standard("Alice"));

    assert!(matches!(
      fx.session.load(&bytes, ValidationMode::Online, None).await,
      Err(Error::RemoteCallFailed(_))
    ));
  }

  #[tokio::test]
  async fn concurrent_license_holds_seat_until_close() {
    let mut fx = fixture().await;
    let license = Generator::default().concurrent("Dan", 1);
    fx.app.sv().license.register(&license).await.unwrap();
    let key = license.license_key().to_string();

    let status = fx.session.heartbeat_status();
    fx.session
      .load(&pack(&fx.app, &license), ValidationMode::Offline, None)
      .await
      .unwrap();
    assert!(fx.session.is_heartbeat_running());

    wait_for(status, |s| matches!(s, HeartbeatStatus::Alive { .. })).await;
    assert_eq!(fx.app.sv().activation.live_count(&key).await.unwrap(), 1);

    fx.session.close().await.unwrap();
    assert!(!fx.session.is_heartbeat_running());
    assert!(fx.session.license().is_none());
    assert_eq!(fx.app.sv().activation.live_count(&key).await.unwrap(), 0);

    fx.session.close().await.unwrap();
  }

  #[tokio::test]
  async fn heartbeat_failure_is_reported_without_teardown() {
    let mut fx = fixture().await;
    fx.session.set_server_endpoint(&dead_endpoint().await).unwrap();
    let license = Generator::default().concurrent("Dan", 2);

    let status = fx.session.heartbeat_status();
    fx.session
      .load(&pack(&fx.app, &license), ValidationMode::Offline, None)
      .await
      .unwrap();

    wait_for(status, |s| matches!(s, HeartbeatStatus::Failed { .. })).await;
    assert_eq!(fx.session.license(), Some(&license));

    assert!(matches!(fx.session.close().await, Err(Error::RemoteCallFailed(_))));
    assert!(fx.session.license().is_none());
    fx.session.close().await.unwrap();
  }

  #[tokio::test]
  async fn configuration_rejects_bad_values() {
    let (_, public) = crypto::generate_keypair();
    let mut session = Session::new(public);

    assert!(session.set_server_endpoint("   ").is_err());
    assert!(session.set_server_endpoint("not a url").is_err());
    assert!(session.set_server_endpoint("ftp://host/licenses").is_err());
    assert_eq!(session.endpoint(), DEFAULT_ENDPOINT);

    session.set_server_endpoint("https://licenses.example.com/api/").unwrap();
    assert_eq!(session.endpoint(), "https://licenses.example.com/api");

    assert!(session.set_heartbeat_interval(Duration::ZERO).is_err());
    session.set_heartbeat_interval(Duration::from_secs(30)).unwrap();
    assert_eq!(session.heartbeat_interval(), Duration::from_secs(30));
  }

  #[tokio::test]
  async fn saved_container_loads_from_file() {
    let fx = fixture().await;
    let mut session = fx.session;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("license.lic");

    let license = Generator::default().subscription(
      "Carol",
      Utc::now(),
      Duration::from_secs(30 * 86400),
    );
    let bytes =
      Session::save(&license, &fx.app.secrets.private_key, Some(path.as_path()))
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), bytes);

    let loaded =
      session.load_file(&path, ValidationMode::Offline, None).await.unwrap();
    assert_eq!(loaded, &license);
  }
}
