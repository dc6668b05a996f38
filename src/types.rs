use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::network::IpNetwork;

/// Upper bound on the per-prefix retry count.
pub const MAX_RETRY_COUNT: u32 = 100;

/// Unique identifier for a scheduled callback.
///
/// A strongly-typed wrapper so callback ids never mix with other uuids.
/// Formats in the canonical hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// The 16 raw bytes, in RFC 4122 order.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A scheduled HTTP callback.
///
/// Tasks are ordered by due time, then by creation time, so the earliest
/// created of two simultaneous callbacks goes first. Two tasks with the same
/// id are always equal, whatever their other fields say.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackTask {
    /// Immutable identity, generated at creation.
    pub id: TaskId,

    /// Absolute http/https target.
    pub url: Url,

    /// Instant at or after which the callback becomes eligible for dispatch.
    pub due_time: DateTime<Utc>,

    /// Instant the task was created.
    pub created_time: DateTime<Utc>,

    /// Remaining delivery attempts. Only ever decreases.
    pub attempts_remaining: u32,

    /// Client-issued authorization cipher, replayed to the target.
    pub authorization_cipher: Option<String>,
}

impl CallbackTask {
    /// Create a task that may be attempted `1 + retry_count` times.
    pub fn new(url: Url, due_time: DateTime<Utc>, retry_count: u32) -> Self {
        Self::with_created_time(url, due_time, Utc::now(), retry_count)
    }

    pub fn with_created_time(
        url: Url,
        due_time: DateTime<Utc>,
        created_time: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: TaskId::new_v4(),
            url,
            due_time,
            created_time,
            attempts_remaining: retry_count.min(MAX_RETRY_COUNT).saturating_add(1),
            authorization_cipher: None,
        }
    }

    /// Attach the client cipher carried on the schedule request.
    pub fn with_authorization_cipher(mut self, cipher: impl Into<String>) -> Self {
        self.authorization_cipher = Some(cipher.into());
        self
    }

    /// Override the generated id. Used by recovery and by cancel lookups.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Ordering key used by the due-time index.
    pub fn schedule_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.due_time, self.created_time)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_remaining == 0
    }
}

impl PartialEq for CallbackTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CallbackTask {}

impl Hash for CallbackTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Ord for CallbackTask {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.id == other.id {
            return Ordering::Equal;
        }
        self.schedule_key()
            .cmp(&other.schedule_key())
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for CallbackTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// ISO 8601 UTC with millisecond precision and a `Z` suffix.
pub fn wire_time(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Authorization policy attached to a configured URL prefix.
///
/// An empty network list means callbacks may be scheduled from anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    /// Prefix this policy was registered under.
    pub url_prefix: String,

    /// Source networks permitted to schedule or cancel.
    pub allowed_from: Vec<IpNetwork>,

    /// Retries after the initial attempt (0..=100).
    pub retry_count: u32,
}

impl AuthorizationPolicy {
    /// Create an unrestricted policy with no retries.
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            allowed_from: Vec::new(),
            retry_count: 0,
        }
    }

    /// Restrict the policy to a source network.
    pub fn allow_from(mut self, network: IpNetwork) -> Self {
        self.allowed_from.push(network);
        self
    }

    /// Set the retry count, clamped to 100.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.min(MAX_RETRY_COUNT);
        self
    }

    /// Whether the given source address may use this policy.
    pub fn permits(&self, source: std::net::IpAddr) -> bool {
        self.allowed_from.is_empty() || self.allowed_from.iter().any(|n| n.contains(source))
    }
}
