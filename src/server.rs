//! HTTP listener: `PUT /Schedule`, `PUT|DELETE /Cancel`, `GET /Status`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::cipher::AUTHORIZATION_HEADER;
use crate::config::UnauthorizedDelay;
use crate::error::ScheduleError;
use crate::supervisor::Supervisor;
use crate::types::{wire_time, TaskId};

pub const PARAM_CALLBACK_TIME: &str = "CallbackTime";
pub const PARAM_CALLBACK_URL: &str = "CallbackUrl";
pub const PARAM_CALLBACK_ID: &str = "CallbackId";

#[derive(Clone)]
pub struct AppState {
    supervisor: Arc<Supervisor>,
    unauthorized_delay: UnauthorizedDelay,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub version: &'static str,
    pub status: &'static str,
    pub timestamp: String,
}

/// Refusal rendered as a status code and a short plain-text reason.
struct ApiError(ScheduleError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match &self.0 {
            // never leak which authorization check failed
            ScheduleError::Unauthorized => "Unauthorized".to_string(),
            ScheduleError::State(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

pub fn router(supervisor: Arc<Supervisor>, unauthorized_delay: UnauthorizedDelay) -> Router {
    let state = AppState {
        supervisor,
        unauthorized_delay,
    };
    Router::new()
        .route("/Schedule", put(schedule))
        .route("/Cancel", put(cancel).delete(cancel))
        .route("/Status", get(status))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening for callback requests");
    }
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn schedule(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        let due_time = parse_callback_time(required(&params, PARAM_CALLBACK_TIME)?)?;
        let url = parse_callback_url(required(&params, PARAM_CALLBACK_URL)?)?;
        let cipher = authorization_header(&headers)?;
        app.supervisor.schedule(url, due_time, cipher, peer.ip()).await
    }
    .await;

    match result {
        Ok(id) => {
            debug!(callback_id = %id, source = %peer.ip(), "schedule accepted");
            (StatusCode::OK, id.to_string()).into_response()
        }
        Err(err) => refuse(&app, err).await,
    }
}

async fn cancel(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        let id = parse_callback_id(required(&params, PARAM_CALLBACK_ID)?)?;
        let url = parse_callback_url(required(&params, PARAM_CALLBACK_URL)?)?;
        let found = app.supervisor.cancel(id, &url, peer.ip()).await?;
        Ok::<_, ScheduleError>((id, found))
    }
    .await;

    match result {
        Ok((id, found)) => {
            debug!(callback_id = %id, found, source = %peer.ip(), "cancel accepted");
            StatusCode::OK.into_response()
        }
        Err(err) => refuse(&app, err).await,
    }
}

async fn status(State(app): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        version: env!("CARGO_PKG_VERSION"),
        status: app.supervisor.status().as_str(),
        timestamp: wire_time(Utc::now()),
    })
}

async fn refuse(app: &AppState, err: ScheduleError) -> Response {
    match &err {
        ScheduleError::Unauthorized => {
            if app.unauthorized_delay == UnauthorizedDelay::Random {
                tokio::time::sleep(unauthorized_jitter()).await;
            }
        }
        ScheduleError::State(inner) => error!(error = %inner, "request failed"),
        other => debug!(error = %other, "request refused"),
    }
    ApiError(err).into_response()
}

/// Sum of two random bytes, in milliseconds.
fn unauthorized_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let millis = u64::from(rng.gen::<u8>()) + u64::from(rng.gen::<u8>());
    Duration::from_millis(millis)
}

/// Query parameter lookup, ignoring the key's case.
fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ScheduleError> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ScheduleError::InvalidRequest(format!("missing {key}")))
}

/// ISO 8601 instant. A value without an offset is read as UTC.
pub fn parse_callback_time(text: &str) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ScheduleError::InvalidRequest(format!("invalid {PARAM_CALLBACK_TIME}")))
}

/// Absolute http or https URL without markup or control characters.
pub fn parse_callback_url(text: &str) -> Result<Url, ScheduleError> {
    let invalid = || ScheduleError::InvalidRequest(format!("invalid {PARAM_CALLBACK_URL}"));

    if text.chars().any(|c| c == '<' || c == '>' || c.is_control()) {
        return Err(invalid());
    }
    let url = Url::parse(text).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

pub fn parse_callback_id(text: &str) -> Result<TaskId, ScheduleError> {
    text.parse::<TaskId>()
        .map_err(|_| ScheduleError::InvalidRequest(format!("invalid {PARAM_CALLBACK_ID}")))
}

fn authorization_header(headers: &HeaderMap) -> Result<Option<String>, ScheduleError> {
    match headers.get(AUTHORIZATION_HEADER) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| ScheduleError::InvalidRequest(format!("invalid {AUTHORIZATION_HEADER} header")))?
                .trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_must_be_absolute_http() {
        assert!(parse_callback_url("http://app.test/cb?x=1").is_ok());
        assert!(parse_callback_url("https://app.test/").is_ok());
        assert!(parse_callback_url("ftp://app.test/").is_err());
        assert!(parse_callback_url("/relative").is_err());
        assert!(parse_callback_url("http://app.test/<script>").is_err());
        assert!(parse_callback_url("http://app.test/\u{7}").is_err());
    }

    #[test]
    fn callback_time_accepts_offsets_and_bare_utc() {
        let zulu = parse_callback_time("2030-01-02T03:04:05Z").unwrap();
        let offset = parse_callback_time("2030-01-02T05:04:05+02:00").unwrap();
        let bare = parse_callback_time("2030-01-02T03:04:05.000").unwrap();
        assert_eq!(zulu, offset);
        assert_eq!(zulu, bare);
        assert!(parse_callback_time("tomorrow").is_err());
    }

    #[test]
    fn query_keys_are_case_insensitive() {
        let mut params = HashMap::new();
        params.insert("callbackurl".to_string(), "http://a.test/".to_string());
        params.insert("CallbackTime".to_string(), "  ".to_string());

        assert_eq!(required(&params, PARAM_CALLBACK_URL).unwrap(), "http://a.test/");
        assert!(required(&params, PARAM_CALLBACK_TIME).is_err());
        assert!(required(&params, PARAM_CALLBACK_ID).is_err());
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..100 {
            assert!(unauthorized_jitter() <= Duration::from_millis(510));
        }
    }
}
