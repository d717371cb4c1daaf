//! The cluster API surface the controller is written against.
//!
//! Everything the controller needs from the platform fits in the
//! [`ClusterApi`] trait: a change feed, point reads, one
//! optimistic-concurrency write, and lease arbitration. The production
//! implementation lives in [`crate::apiserver`]; the deterministic
//! in-memory one used by the test suite lives in `crate::mock` (behind
//! the `mock` feature).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::object::{ScopeResource, WatchEvent, WorkloadResource};

/// Transport-level failure talking to the platform.
///
/// Always treated as transient by callers: retried with bounded
/// backoff, never surfaced as process failure.
#[derive(Debug, Error)]
#[error("cluster api error: {0}")]
pub struct ApiError(pub String);

/// Failure modes of the change feed, carried as stream items.
#[derive(Clone, Debug, Error)]
pub enum WatchError {
    /// The feed's position is no longer valid (e.g. the resumption
    /// token expired after a long disconnect). The stream must be
    /// closed and reopened with a fresh or reset token.
    #[error("watch desynced: {0}")]
    Desynced(String),
    /// A transport-level hiccup; reopening at the last good token with
    /// backoff is sufficient.
    #[error("watch transport error: {0}")]
    Transport(String),
}

/// Outcome of submitting a workload update.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The submitted concurrency token was stale; the caller should
    /// re-read and retry.
    #[error("conflict: resource changed since last read")]
    Conflict,
    /// The object vanished between read and write.
    #[error("resource not found")]
    NotFound,
    /// Anything else; transient.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A request to acquire or extend the election lease.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    /// Name of the lease record arbitrating this election scope.
    pub lease_name: String,
    /// Identity of the requesting process instance.
    pub holder: String,
    /// How long the lease remains valid after a successful renewal.
    pub duration: Duration,
}

/// Platform verdict on a lease request.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaseGrant {
    /// The lease is held by the requesting identity until `duration`
    /// elapses without renewal.
    Granted,
    /// Another instance holds an unexpired lease.
    Denied {
        /// Identity of the current holder, when known.
        holder: String,
    },
}

/// The live feed type produced by [`ClusterApi::watch`].
pub type EventStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// Narrow interface to the cluster API.
///
/// Contract notes:
/// - `watch` with `resume_token: None` subscribes to future changes
///   only; `Some(token)` resumes from a known position.
/// - `update_workload` must submit the resource's `resource_version`
///   and fail with [`UpdateError::Conflict`] when it is stale.
/// - `acquire_or_renew_lease` grants when the lease is free, expired,
///   or already held by the requesting identity, atomically.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Opens the change feed for workload resources.
    async fn watch(&self, resume_token: Option<&str>) -> Result<EventStream, ApiError>;

    /// Lists all workload resources plus the feed token to watch from.
    async fn list_workloads(&self) -> Result<(Vec<WorkloadResource>, String), ApiError>;

    /// Fetches one workload, `None` if it no longer exists.
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadResource>, ApiError>;

    /// Fetches the enclosing scope of a workload, `None` if missing.
    async fn get_scope(&self, name: &str) -> Result<Option<ScopeResource>, ApiError>;

    /// Submits an annotation update under optimistic concurrency,
    /// returning the stored object (with its fresh token) on success.
    async fn update_workload(
        &self,
        resource: &WorkloadResource,
    ) -> Result<WorkloadResource, UpdateError>;

    /// Attempts to acquire or extend the election lease.
    async fn acquire_or_renew_lease(&self, req: &LeaseRequest) -> Result<LeaseGrant, ApiError>;

    /// Voluntarily drops the lease if (and only if) `holder` owns it.
    async fn release_lease(&self, lease_name: &str, holder: &str) -> Result<(), ApiError>;
}
