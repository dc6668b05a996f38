//! One callback attempt: the outbound POST and how its response is read.

use std::time::Duration;

use chrono::Utc;
use reqwest::{redirect, Client, StatusCode};
use tracing::warn;

use crate::cipher::{server_response_header, AUTHORIZATION_HEADER};
use crate::error::{DeliveryOutcome, FailureReason};
use crate::types::{wire_time, CallbackTask};

pub const FORM_CALLBACK_ID: &str = "CallbackId";
pub const FORM_CALLBACK_TIME: &str = "CallbackTime";
pub const FORM_CURRENT_SERVICE_TIME: &str = "CurrentServiceTime";

/// How a callback target's status code is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Retryable,
    NonRetryable,
}

pub fn classify(status: StatusCode) -> ResponseClass {
    match status.as_u16() {
        200 | 201 | 202 | 204 | 206 => ResponseClass::Success,
        304 | 400 | 401 | 403 | 404 | 405 | 406 | 409 | 410 | 411 | 412 | 415 | 501 | 505 => {
            ResponseClass::NonRetryable
        }
        _ => ResponseClass::Retryable,
    }
}

/// HTTP client shared by all attempts.
///
/// Redirects are not followed; a 3xx answer is treated like any other
/// unexpected status.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .redirect(redirect::Policy::none())
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// POST the callback to its target.
///
/// `CallbackTime` carries the task's current due time. After a retry this
/// is the moved time, not the time originally requested.
///
/// Never fails: transport errors become retryable outcomes.
pub async fn deliver(client: &Client, task: &CallbackTask, timeout: Duration) -> DeliveryOutcome {
    let form = [
        (FORM_CALLBACK_ID, task.id.to_string()),
        (FORM_CALLBACK_TIME, wire_time(task.due_time)),
        (FORM_CURRENT_SERVICE_TIME, wire_time(Utc::now())),
    ];

    let mut request = client.post(task.url.clone()).timeout(timeout).form(&form);

    if let Some(cipher) = task.authorization_cipher.as_deref() {
        match server_response_header(Some(cipher), &task.id) {
            Some(value) => request = request.header(AUTHORIZATION_HEADER, value),
            None => warn!(callback_id = %task.id, "stored authorization cipher is unreadable"),
        }
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            match classify(status) {
                ResponseClass::Success => DeliveryOutcome::Delivered,
                ResponseClass::NonRetryable => {
                    DeliveryOutcome::Failed(FailureReason::Rejected(status.as_u16()))
                }
                ResponseClass::Retryable => {
                    DeliveryOutcome::Failed(FailureReason::RemoteError(status.as_u16()))
                }
            }
        }
        Err(err) => {
            if err.is_timeout() {
                DeliveryOutcome::Failed(FailureReason::Timeout)
            } else {
                DeliveryOutcome::Failed(FailureReason::Network)
            }
        }
    }
}
