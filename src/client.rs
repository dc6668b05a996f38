//! Minimal client for applications that schedule callbacks.
//!
//! Settings resolve per call: a [`RequestOptions`] value overrides the
//! client-wide [`ClientOptions`] for that request only.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::cipher::{self, AuthorizationCipher, AUTHORIZATION_HEADER};
use crate::server::{PARAM_CALLBACK_ID, PARAM_CALLBACK_TIME, PARAM_CALLBACK_URL};
use crate::types::{wire_time, TaskId};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(13);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to callback service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback service refused the request with status {status}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response from callback service: {0}")]
    InvalidResponse(String),

    #[error("invalid service address: {0}")]
    InvalidServiceUrl(#[from] url::ParseError),
}

/// Client-wide defaults.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub service_base_url: Url,
    pub request_timeout: Duration,
    /// Shared secret used to sign schedule requests. Unsigned when absent.
    pub authorization_key: Option<Vec<u8>>,
}

impl ClientOptions {
    pub fn new(service_base_url: Url) -> Self {
        Self {
            service_base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            authorization_key: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_authorization_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.authorization_key = Some(key.into());
        self
    }
}

/// Per-call overrides. Unset fields fall back to [`ClientOptions`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub service_base_url: Option<Url>,
    pub request_timeout: Option<Duration>,
    pub authorization_key: Option<Vec<u8>>,
}

impl RequestOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_service_base_url(mut self, url: Url) -> Self {
        self.service_base_url = Some(url);
        self
    }
}

struct Resolved<'a> {
    base: &'a Url,
    timeout: Duration,
    key: Option<&'a [u8]>,
}

fn resolve<'a>(defaults: &'a ClientOptions, request: Option<&'a RequestOptions>) -> Resolved<'a> {
    Resolved {
        base: request
            .and_then(|r| r.service_base_url.as_ref())
            .unwrap_or(&defaults.service_base_url),
        timeout: request
            .and_then(|r| r.request_timeout)
            .unwrap_or(defaults.request_timeout),
        key: request
            .and_then(|r| r.authorization_key.as_deref())
            .or(defaults.authorization_key.as_deref()),
    }
}

pub struct CallbackClient {
    http: Client,
    options: ClientOptions,
}

impl CallbackClient {
    pub fn new(options: ClientOptions) -> reqwest::Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            options,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Ask the service to POST to `callback_url` at `callback_time`.
    pub async fn schedule(
        &self,
        callback_url: &Url,
        callback_time: DateTime<Utc>,
        request: Option<&RequestOptions>,
    ) -> Result<TaskId, ClientError> {
        let settings = resolve(&self.options, request);

        let mut endpoint = service_endpoint(settings.base, "Schedule")?;
        endpoint
            .query_pairs_mut()
            .append_pair(PARAM_CALLBACK_TIME, &wire_time(callback_time))
            .append_pair(PARAM_CALLBACK_URL, callback_url.as_str());

        let mut builder = self.http.put(endpoint).timeout(settings.timeout);
        if let Some(key) = settings.key {
            let cipher = AuthorizationCipher::issue(key, callback_url.as_str());
            builder = builder.header(AUTHORIZATION_HEADER, cipher.to_string());
        }

        let body = send(builder).await?;
        let parsed = body.trim().parse::<TaskId>();
        parsed.map_err(|_| ClientError::InvalidResponse(body))
    }

    pub async fn cancel(
        &self,
        callback_id: TaskId,
        callback_url: &Url,
        request: Option<&RequestOptions>,
    ) -> Result<(), ClientError> {
        let settings = resolve(&self.options, request);

        let mut endpoint = service_endpoint(settings.base, "Cancel")?;
        endpoint
            .query_pairs_mut()
            .append_pair(PARAM_CALLBACK_ID, &callback_id.to_string())
            .append_pair(PARAM_CALLBACK_URL, callback_url.as_str());

        send(self.http.put(endpoint).timeout(settings.timeout)).await?;
        Ok(())
    }
}

/// Resolve `name` under `base`, treating the base path as a directory.
fn service_endpoint(base: &Url, name: &str) -> Result<Url, url::ParseError> {
    if base.path().ends_with('/') {
        return base.join(name);
    }
    let mut directory = base.clone();
    directory.set_path(&format!("{}/", base.path()));
    directory.join(name)
}

async fn send(builder: reqwest::RequestBuilder) -> Result<String, ClientError> {
    let resp = builder.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Check an inbound callback against the request that scheduled it.
///
/// `authorization` is the `Revalee-Auth` header value and `callback_id` the
/// `CallbackId` form field. Fails closed on any missing or malformed input.
pub fn validate_callback(
    authorization: Option<&str>,
    callback_id: &str,
    callback_url: &str,
    secret: &[u8],
) -> bool {
    let Some(header) = authorization else {
        return false;
    };
    let Ok(id) = callback_id.parse::<TaskId>() else {
        return false;
    };
    cipher::validate(header, secret, callback_url, &id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn request_options_override_client_defaults() {
        let defaults = ClientOptions::new(Url::parse("http://svc.test/").unwrap())
            .with_authorization_key(b"k".to_vec());
        let request = RequestOptions::default().with_request_timeout(Duration::from_secs(2));

        let global = resolve(&defaults, None);
        assert_eq!(global.timeout, DEFAULT_REQUEST_TIMEOUT);

        let scoped = resolve(&defaults, Some(&request));
        assert_eq!(scoped.timeout, Duration::from_secs(2));
        assert_eq!(scoped.base.as_str(), "http://svc.test/");
        assert_eq!(scoped.key, Some(&b"k"[..]));
    }

    #[tokio::test]
    async fn schedule_sends_signed_put() {
        let server = MockServer::start().await;
        let id = TaskId::new_v4();
        Mock::given(method("PUT"))
            .and(path("/Schedule"))
            .and(query_param(PARAM_CALLBACK_URL, "http://app.test/cb"))
            .and(header_exists(AUTHORIZATION_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_string(id.to_string()))
            .expect(1)
            .mount(&server)
            .await;

        let options = ClientOptions::new(Url::parse(&server.uri()).unwrap()).with_authorization_key(b"secret".to_vec());
        let client = CallbackClient::new(options).unwrap();
        let scheduled = client
            .schedule(&Url::parse("http://app.test/cb").unwrap(), Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(scheduled, id);
    }

    #[test]
    fn service_endpoint_keeps_base_path() {
        let bare = Url::parse("http://svc.test").unwrap();
        assert_eq!(service_endpoint(&bare, "Schedule").unwrap().as_str(), "http://svc.test/Schedule");

        let nested = Url::parse("http://svc.test/revalee").unwrap();
        assert_eq!(
            service_endpoint(&nested, "Schedule").unwrap().as_str(),
            "http://svc.test/revalee/Schedule"
        );

        let slashed = Url::parse("http://svc.test/revalee/").unwrap();
        assert_eq!(
            service_endpoint(&slashed, "Cancel").unwrap().as_str(),
            "http://svc.test/revalee/Cancel"
        );
    }

    #[tokio::test]
    async fn requests_go_under_base_path_prefix() {
        let server = MockServer::start().await;
        let id = TaskId::new_v4();
        Mock::given(method("PUT"))
            .and(path("/callbacks/Schedule"))
            .respond_with(ResponseTemplate::new(200).set_body_string(id.to_string()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/callbacks/Cancel"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/callbacks", server.uri())).unwrap();
        let client = CallbackClient::new(ClientOptions::new(base)).unwrap();
        let callback_url = Url::parse("http://app.test/cb").unwrap();
        let scheduled = client.schedule(&callback_url, Utc::now(), None).await.unwrap();
        assert_eq!(scheduled, id);
        client.cancel(scheduled, &callback_url, None).await.unwrap();
    }

    #[tokio::test]
    async fn refusal_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = CallbackClient::new(ClientOptions::new(Url::parse(&server.uri()).unwrap())).unwrap();
        let err = client
            .cancel(TaskId::new_v4(), &Url::parse("http://app.test/cb").unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 401, .. }));
    }

    #[test]
    fn validate_callback_fails_closed() {
        let secret = b"secret";
        let url = "http://app.test/cb";
        let id = TaskId::new_v4();
        let client_cipher = AuthorizationCipher::issue(secret, url).to_string();
        let header = cipher::server_response_header(Some(&client_cipher), &id).unwrap();

        assert!(validate_callback(Some(&header), &id.to_string(), url, secret));
        assert!(!validate_callback(None, &id.to_string(), url, secret));
        assert!(!validate_callback(Some(&header), "not-a-guid", url, secret));
        assert!(!validate_callback(Some(&header), &TaskId::new_v4().to_string(), url, secret));
        assert!(!validate_callback(Some(&header), &id.to_string(), "http://app.test/other", secret));
    }
}
