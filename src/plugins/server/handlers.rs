use std::sync::Arc;

use axum::{
  Json,
  extract::{Request, State},
  http::{StatusCode, header},
  middleware::Next,
  response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use subtle::ConstantTimeEq;

use crate::{
  api::{ActivateReq, RenewReq, Res, RevokeReq, SeatReq, SeatRes, ValidateReq},
  entity::activation,
  model::License,
  prelude::*,
  state::AppState,
};

impl From<activation::Model> for SeatRes {
  fn from(activation: activation::Model) -> Self {
    Self {
      machine_id: activation.machine_id,
      last_heartbeat: activation.last_heartbeat,
    }
  }
}

pub async fn require_api_key(
  State(app): State<Arc<AppState>>,
  req: Request,
  next: Next,
) -> Response {
  let token = req
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Bearer "));

  let authorized = token.is_some_and(|token| {
    bool::from(token.as_bytes().ct_eq(app.secrets.api_key.as_bytes()))
  });
  if !authorized {
    let body = Res::<()> {
      success: false,
      error: Some("Unauthorized".into()),
      data: None,
    };
    return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
  }

  next.run(req).await
}

pub async fn validate(
  State(app): State<Arc<AppState>>,
  Json(req): Json<ValidateReq>,
) -> Result<Json<Res<License>>> {
  let container =
    BASE64.decode(req.container.trim()).map_err(|_| Error::InvalidFormat)?;
  let license = app
    .sv()
    .license
    .validate_online(&req.license_key, &container, &req.params)
    .await?;
  Ok(Json(Res::ok(license)))
}

pub async fn activate(
  State(app): State<Arc<AppState>>,
  Json(req): Json<ActivateReq>,
) -> Result<Json<Res<SeatRes>>> {
  let activation = app
    .sv()
    .activation
    .activate_with(
      &req.license_key,
      req.machine_id.as_deref(),
      req.user_id.as_deref(),
      req.mode,
    )
    .await?;
  Ok(Json(Res::ok(activation.into())))
}

pub async fn heartbeat(
  State(app): State<Arc<AppState>>,
  Json(req): Json<SeatReq>,
) -> Result<Json<Res<SeatRes>>> {
  let activation =
    app.sv().activation.heartbeat(&req.license_key, &req.machine_id).await?;
  Ok(Json(Res::ok(activation.into())))
}

pub async fn disconnect(
  State(app): State<Arc<AppState>>,
  Json(req): Json<SeatReq>,
) -> Result<Json<Res<bool>>> {
  let released =
    app.sv().activation.disconnect(&req.license_key, &req.machine_id).await?;
  Ok(Json(Res::ok(released)))
}

pub async fn revoke(
  State(app): State<Arc<AppState>>,
  Json(req): Json<RevokeReq>,
) -> Result<Json<Res<()>>> {
  app
    .sv()
    .activation
    .revoke(&req.license_key, req.machine_id.as_deref())
    .await?;
  Ok(Json(Res::ok(())))
}

pub async fn renew(
  State(app): State<Arc<AppState>>,
  Json(req): Json<RenewReq>,
) -> Result<Json<Res<DateTime<Utc>>>> {
  let license =
    app.sv().license.renew(&req.license_key, req.expiration_date).await?;
  Ok(Json(Res::ok(license.expiration_date.unwrap_or(req.expiration_date))))
}

pub async fn health() -> &'static str {
  "OK"
}

#[cfg(test)]
mod tests {
  use axum::{
    body::{Body, to_bytes},
    http::Method,
  };
  use tower::ServiceExt;

  use super::*;
  use crate::{
    clock::ManualClock, codec, generator::Generator, plugins::server::router,
    state::testing, validator::Params,
  };

  async fn call(
    app: &Arc<AppState>,
    path: &str,
    token: Option<&str>,
    body: json::Value,
  ) -> (StatusCode, json::Value) {
    let mut req = axum::http::Request::builder()
      .method(Method::POST)
      .uri(path)
      .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
      req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = req.body(Body::from(body.to_string())).unwrap();

    let res = router(app.clone()).oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, json::from_slice(&bytes).unwrap())
  }

  async fn setup() -> Arc<AppState> {
    Arc::new(testing::state(Arc::new(ManualClock::default())).await)
  }

  #[tokio::test]
  async fn requests_without_api_key_are_rejected() {
    let app = setup().await;
    let body = json::json!({ "license_key": "X", "machine_id": "M1" });

    let (status, res) = call(&app, "/api/licenses/heartbeat", None, body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(res["success"], false);

    let (status, _) =
      call(&app, "/api/licenses/heartbeat", Some("wrong"), body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let prefix = &app.secrets.api_key[..app.secrets.api_key.len() - 1];
    let (status, _) =
      call(&app, "/api/licenses/heartbeat", Some(prefix), body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, res) = call(
      &app,
      "/api/licenses/heartbeat",
      Some(app.secrets.api_key.as_str()),
      body,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(res["success"], false);
  }

  #[tokio::test]
  async fn seat_lifecycle_over_http() {
    let app = setup().await;
    let token = app.secrets.api_key.clone();
    let license = Generator::default().concurrent("Dan", 1);
    app.sv().license.register(&license).await.unwrap();
    let key = license.license_key();

    let (status, res) = call(
      &app,
      "/api/licenses/activate",
      Some(&token),
      json::json!({ "license_key": key, "machine_id": "M1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["data"]["machine_id"], "M1");

    let (status, res) = call(
      &app,
      "/api/licenses/activate",
      Some(&token),
      json::json!({ "license_key": key, "machine_id": "M2" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(res["success"], false);

    let (status, _) = call(
      &app,
      "/api/licenses/heartbeat",
      Some(&token),
      json::json!({ "license_key": key, "machine_id": "M1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, res) = call(
      &app,
      "/api/licenses/disconnect",
      Some(&token),
      json::json!({ "license_key": key, "machine_id": "M1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["data"], true);

    let (status, _) = call(
      &app,
      "/api/licenses/revoke",
      Some(&token),
      json::json!({ "license_key": key }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
      &app,
      "/api/licenses/activate",
      Some(&token),
      json::json!({ "license_key": key, "machine_id": "M2" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn validate_reports_rule_failures() {
    let app = setup().await;
    let token = app.secrets.api_key.clone();
    let license = Generator::default().node_locked(Some("HW-123")).unwrap();
    app.sv().license.register(&license).await.unwrap();
    let container =
      BASE64.encode(codec::pack(&license, &app.secrets.private_key).unwrap());

    let good = Params::from_license(&license);
    let (status, res) = call(
      &app,
      "/api/licenses/validate",
      Some(&token),
      json::json!({
        "license_key": license.license_key(),
        "params": good,
        "container": container,
      }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["data"]["hardware_id"], "HW-123");

    let (status, res) = call(
      &app,
      "/api/licenses/validate",
      Some(&token),
      json::json!({
        "license_key": license.license_key(),
        "params": { "HardwareId": "HW-999" },
        "container": container,
      }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(res["error"].as_str().unwrap().contains("HardwareId"));

    let (status, _) = call(
      &app,
      "/api/licenses/validate",
      Some(&token),
      json::json!({
        "license_key": license.license_key(),
        "container": "not base64!",
      }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn health_is_public() {
    let app = setup().await;
    let req = axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap();
    let res = router(app).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
  }
}
