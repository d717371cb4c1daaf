//! Idempotent stamping of eligible workloads.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::api::{ApiError, ClusterApi, UpdateError};
use crate::object::WorkloadResource;

/// Write conflicts tolerated before giving up on one event.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Reconciliation error variants. All non-fatal: the event loop logs
/// and moves on to the next event.
#[derive(Debug, Error)]
pub enum Error {
    #[error("update conflicted {attempts} times, giving up")]
    ConflictsExhausted { attempts: usize },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The observable record emitted once per successfully stamped workload.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedRecord {
    /// Workload name.
    pub name: String,
    /// Enclosing scope (namespace) name.
    pub namespace: String,
    /// The timestamp value written under the processed marker.
    pub applied_at: String,
}

/// Consumes [`AppliedRecord`]s; the external telemetry collaborator.
pub trait Notifier: Send + Sync {
    /// Called exactly once per successful reconciliation.
    fn applied(&self, record: &AppliedRecord);
}

/// Default notifier; reports through the process log stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn applied(&self, record: &AppliedRecord) {
        tracing::info!(
            name = %record.name,
            namespace = %record.namespace,
            applied_at = %record.applied_at,
            "stamped workload"
        );
    }
}

/// Outcome of one [`Reconciler::apply`] call.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// The marker was written; carries the emitted record.
    Stamped(AppliedRecord),
    /// The workload vanished between the event and the write. Skipped.
    Gone,
}

/// Applies the processing-marker annotation under optimistic
/// concurrency, re-reading and retrying on write conflicts.
///
/// Re-applying to an already-stamped workload only refreshes the
/// timestamp value, so duplicate processing (after a resync, or across
/// a leadership handover) is harmless.
pub struct Reconciler<C> {
    api: Arc<C>,
    processed_marker: String,
}

impl<C: ClusterApi> Reconciler<C> {
    /// Builds a reconciler writing under the given marker key.
    pub fn new(api: Arc<C>, processed_marker: impl Into<String>) -> Self {
        Self {
            api,
            processed_marker: processed_marker.into(),
        }
    }

    /// Stamps one workload.
    pub async fn apply(&self, resource: &WorkloadResource) -> Result<Applied, Error> {
        let mut current = resource.clone();
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let applied_at = sortable_timestamp();
            current.set_annotation(&self.processed_marker, applied_at.clone());
            match self.api.update_workload(&current).await {
                Ok(_) => {
                    return Ok(Applied::Stamped(AppliedRecord {
                        name: current.name.clone(),
                        namespace: current.namespace.clone(),
                        applied_at,
                    }));
                }
                Err(UpdateError::Conflict) => {
                    tracing::debug!(
                        namespace = %current.namespace,
                        name = %current.name,
                        attempt,
                        "stale concurrency token, re-reading"
                    );
                    match self.api.get_workload(&current.namespace, &current.name).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(Applied::Gone),
                    }
                }
                Err(UpdateError::NotFound) => return Ok(Applied::Gone),
                Err(UpdateError::Api(err)) => return Err(err.into()),
            }
        }
        Err(Error::ConflictsExhausted {
            attempts: MAX_CONFLICT_RETRIES,
        })
    }
}

/// Current time in a fixed, lexicographically sortable, UTC-qualified
/// rendering (RFC 3339, second precision, `Z` suffix).
fn sortable_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_utc_qualified_and_fixed_width() {
        let ts = sortable_timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-01-01T00:00:00Z".len());
    }
}
