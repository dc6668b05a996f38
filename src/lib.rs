//! A single-node durable HTTP callback scheduler.
//!
//! Clients ask the service to POST to a URL at a future instant. The
//! service keeps the request in a due-time index backed by a persistence
//! provider, fires the callback on a bounded worker pool, and retries
//! transient failures with per-destination backoff.
//!
//! ## Guarantees
//! - At-least-once delivery attempts, at or after the due time
//! - A callback scheduled with `N` retries is attempted at most `N + 1` times
//! - Pending callbacks survive a restart when a durable provider is configured
//! - Bounded concurrency with explicit overload signalling
//! - Callback targets can verify a request came from the scheduling application
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Cancellation of an attempt already in flight
//! - Distributed coordination or multi-node failover
//! - Payloads or capture of the target's response
//!
//! The HTTP surface is intentionally thin; the engine lives in
//! [`Supervisor`] and the managers it composes.

pub mod authorization;
pub mod cipher;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod network;
pub mod retry;
pub mod server;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod timer;
pub mod types;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod storage_sqlite;

pub use authorization::{AuthorizationDecision, AuthorizationTable, DuplicatePrefix, UrlPrefixTable};
pub use cipher::{AuthorizationCipher, CipherSource, AUTHORIZATION_HEADER};
pub use client::{validate_callback, CallbackClient, ClientError, ClientOptions, RequestOptions};
pub use config::{ConfigError, ServiceConfig, UnauthorizedDelay};
pub use dispatcher::{DispatcherConfig, WorkManager};
pub use error::{DeliveryOutcome, FailureReason, ScheduleError};
pub use index::{IndexError, IndexedHeap, SharedIndex};
pub use network::{IpNetwork, NetworkParseError};
pub use retry::RetryHeuristics;
pub use state::{CancelMatch, StateError, StateManager};
pub use storage::{InMemoryStore, NullStore, StoreError, TaskStore};
pub use supervisor::{ServiceStatus, Supervisor, SupervisorError, SupervisorOptions};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use timer::TimeManager;
pub use types::{AuthorizationPolicy, CallbackTask, TaskId};

#[cfg(feature = "sqlite")]
pub use storage_sqlite::SqliteStore;
