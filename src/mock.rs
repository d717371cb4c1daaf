//! Deterministic in-memory [`ClusterApi`] for the test suite.
//!
//! Holds workloads, scopes and the election lease under one lock,
//! assigns monotonically increasing concurrency tokens, fans watch
//! events out to every open subscription, and supports scripted
//! failure injection (transport errors, feed desyncs, silent
//! out-of-band mutations to force write conflicts). Lease expiry is
//! measured with `tokio::time::Instant` so tests can run under paused
//! time.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::time::Instant;

use crate::api::{
    ApiError, ClusterApi, EventStream, LeaseGrant, LeaseRequest, UpdateError, WatchError,
};
use crate::object::{EventPayload, ScopeResource, WatchEvent, WorkloadResource};

type WatchItem = Result<WatchEvent, WatchError>;

struct MockLease {
    holder: String,
    renewed_at: Instant,
    duration: Duration,
}

#[derive(Default)]
struct State {
    workloads: BTreeMap<(String, String), WorkloadResource>,
    scopes: BTreeMap<String, ScopeResource>,
    lease: Option<MockLease>,
    watchers: Vec<mpsc::UnboundedSender<WatchItem>>,
    version: u64,
    watch_opens: u64,
    fail_updates: u32,
    conflict_updates: u32,
    fail_lease_ops: u32,
    hang_lease_ops: bool,
}

/// Scriptable in-memory cluster.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

impl MockCluster {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a scope.
    pub fn put_scope(&self, name: &str, annotations: Option<BTreeMap<String, String>>) {
        let mut state = self.state.lock().unwrap();
        state.scopes.insert(
            name.to_string(),
            ScopeResource {
                name: name.to_string(),
                annotations,
            },
        );
    }

    /// Stores a workload and broadcasts the corresponding Added event.
    pub fn create_workload(
        &self,
        namespace: &str,
        name: &str,
        annotations: Option<BTreeMap<String, String>>,
    ) -> WorkloadResource {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let workload = WorkloadResource {
            namespace: namespace.to_string(),
            name: name.to_string(),
            annotations,
            resource_version: Some(state.version.to_string()),
        };
        state
            .workloads
            .insert((namespace.to_string(), name.to_string()), workload.clone());
        broadcast(
            &mut state,
            Ok(WatchEvent::Added(EventPayload::Workload(Box::new(
                workload.clone(),
            )))),
        );
        workload
    }

    /// Injects an arbitrary feed item (unrecognized payload, desync,
    /// transport error) into every open subscription.
    pub fn push_raw(&self, item: WatchItem) {
        let mut state = self.state.lock().unwrap();
        broadcast(&mut state, item);
    }

    /// Bumps a workload's concurrency token without emitting an event,
    /// so the next update submitted with the old token conflicts.
    pub fn touch_silently(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let version = state.version.to_string();
        if let Some(workload) = state
            .workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            workload.resource_version = Some(version);
        }
    }

    /// Current stored copy of a workload.
    pub fn workload(&self, namespace: &str, name: &str) -> Option<WorkloadResource> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fails the next `n` update submissions with a transport error.
    pub fn fail_next_updates(&self, n: u32) {
        self.state.lock().unwrap().fail_updates = n;
    }

    /// Rejects the next `n` update submissions as conflicts regardless
    /// of the submitted token.
    pub fn conflict_next_updates(&self, n: u32) {
        self.state.lock().unwrap().conflict_updates = n;
    }

    /// Fails the next `n` lease operations with a transport error.
    pub fn fail_next_lease_ops(&self, n: u32) {
        self.state.lock().unwrap().fail_lease_ops = n;
    }

    /// Makes every subsequent lease operation park forever, simulating
    /// an unresponsive platform.
    pub fn hang_lease_ops(&self) {
        self.state.lock().unwrap().hang_lease_ops = true;
    }

    /// Identity currently holding the lease, if any.
    pub fn lease_holder(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .lease
            .as_ref()
            .map(|l| l.holder.clone())
    }

    /// How many watch subscriptions have been opened so far.
    pub fn watch_opens(&self) -> u64 {
        self.state.lock().unwrap().watch_opens
    }
}

fn broadcast(state: &mut State, item: WatchItem) {
    state
        .watchers
        .retain(|tx| tx.unbounded_send(item.clone()).is_ok());
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn watch(&self, _resume_token: Option<&str>) -> Result<EventStream, ApiError> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock().unwrap();
        state.watch_opens += 1;
        state.watchers.push(tx);
        Ok(rx.boxed())
    }

    async fn list_workloads(&self) -> Result<(Vec<WorkloadResource>, String), ApiError> {
        let state = self.state.lock().unwrap();
        let items = state.workloads.values().cloned().collect();
        Ok((items, state.version.to_string()))
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadResource>, ApiError> {
        Ok(self.workload(namespace, name))
    }

    async fn get_scope(&self, name: &str) -> Result<Option<ScopeResource>, ApiError> {
        Ok(self.state.lock().unwrap().scopes.get(name).cloned())
    }

    async fn update_workload(
        &self,
        resource: &WorkloadResource,
    ) -> Result<WorkloadResource, UpdateError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_updates > 0 {
            state.fail_updates -= 1;
            return Err(UpdateError::Api(ApiError("injected update failure".into())));
        }
        if state.conflict_updates > 0 {
            state.conflict_updates -= 1;
            return Err(UpdateError::Conflict);
        }
        state.version += 1;
        let version = state.version.to_string();
        let key = (resource.namespace.clone(), resource.name.clone());
        let Some(stored) = state.workloads.get_mut(&key) else {
            return Err(UpdateError::NotFound);
        };
        if stored.resource_version != resource.resource_version {
            return Err(UpdateError::Conflict);
        }
        stored.annotations = resource.annotations.clone();
        stored.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn acquire_or_renew_lease(&self, req: &LeaseRequest) -> Result<LeaseGrant, ApiError> {
        if self.state.lock().unwrap().hang_lease_ops {
            futures::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_lease_ops > 0 {
            state.fail_lease_ops -= 1;
            return Err(ApiError("injected lease failure".into()));
        }
        let now = Instant::now();
        match &mut state.lease {
            Some(lease) if lease.holder == req.holder => {
                lease.renewed_at = now;
                lease.duration = req.duration;
                Ok(LeaseGrant::Granted)
            }
            Some(lease) if now.duration_since(lease.renewed_at) < lease.duration => {
                Ok(LeaseGrant::Denied {
                    holder: lease.holder.clone(),
                })
            }
            _ => {
                state.lease = Some(MockLease {
                    holder: req.holder.clone(),
                    renewed_at: now,
                    duration: req.duration,
                });
                Ok(LeaseGrant::Granted)
            }
        }
    }

    async fn release_lease(&self, _lease_name: &str, holder: &str) -> Result<(), ApiError> {
        if self.state.lock().unwrap().hang_lease_ops {
            futures::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.lease.as_ref().is_some_and(|l| l.holder == holder) {
            state.lease = None;
        }
        Ok(())
    }
}
