//! Production [`ClusterApi`] backed by the Kubernetes apiserver.
//!
//! Pods are the workload resource, namespaces the scope, and a
//! `coordination.k8s.io/v1` Lease the election record. Annotation
//! updates go out as merge patches carrying the observed
//! `resourceVersion`, so the apiserver itself enforces the optimistic
//! concurrency the reconciler's retry loop depends on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::{Api, Client};

use crate::api::{
    ApiError, ClusterApi, EventStream, LeaseGrant, LeaseRequest, UpdateError, WatchError,
};
use crate::object::{EventPayload, ScopeResource, WatchEvent, WorkloadResource};

/// HTTP Gone; the watch window has expired and a fresh start is needed.
const CODE_GONE: u16 = 410;
const CODE_CONFLICT: u16 = 409;
const CODE_NOT_FOUND: u16 = 404;

/// Kubernetes-backed cluster access.
#[derive(Clone)]
pub struct ApiServer {
    client: Client,
    lease_namespace: String,
}

impl ApiServer {
    /// Wraps an authenticated client; `lease_namespace` is where the
    /// election lease record lives.
    pub fn new(client: Client, lease_namespace: impl Into<String>) -> Self {
        Self {
            client,
            lease_namespace: lease_namespace.into(),
        }
    }

    fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.lease_namespace)
    }
}

/// Boundary decode: pods without full identity do occur in theory
/// (heterogeneous or truncated payloads) and must surface as a
/// skippable variant rather than a fault.
fn decode_pod(pod: Pod) -> EventPayload {
    match workload_from_pod(pod) {
        Some(workload) => EventPayload::Workload(Box::new(workload)),
        None => EventPayload::Unrecognized {
            kind: "Pod without namespace/name".into(),
        },
    }
}

fn workload_from_pod(pod: Pod) -> Option<WorkloadResource> {
    let namespace = pod.metadata.namespace?;
    let name = pod.metadata.name?;
    Some(WorkloadResource {
        namespace,
        name,
        annotations: pod.metadata.annotations,
        resource_version: pod.metadata.resource_version,
    })
}

fn transport(err: impl std::fmt::Display) -> ApiError {
    ApiError(err.to_string())
}

/// LeaseSpec durations are `i32` seconds; clamp rather than wrap when
/// the configured duration does not fit.
fn lease_duration_secs(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn lease_expired(spec: &LeaseSpec, fallback_duration_secs: i64) -> bool {
    let Some(renewed) = &spec.renew_time else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .map_or(fallback_duration_secs, i64::from);
    renewed.0 + chrono::Duration::seconds(duration) < Utc::now()
}

#[async_trait]
impl ClusterApi for ApiServer {
    async fn watch(&self, resume_token: Option<&str>) -> Result<EventStream, ApiError> {
        let stream = self
            .pods_all()
            .watch(&WatchParams::default(), resume_token.unwrap_or(""))
            .await
            .map_err(transport)?;
        let stream = stream
            .map_err(|err| WatchError::Transport(err.to_string()))
            .map(|item| {
                item.and_then(|event| match event {
                    kube::api::WatchEvent::Added(pod) => Ok(WatchEvent::Added(decode_pod(pod))),
                    kube::api::WatchEvent::Modified(pod) => {
                        Ok(WatchEvent::Modified(decode_pod(pod)))
                    }
                    kube::api::WatchEvent::Deleted(pod) => Ok(WatchEvent::Deleted(decode_pod(pod))),
                    kube::api::WatchEvent::Bookmark(bookmark) => {
                        Ok(WatchEvent::Bookmark(bookmark.metadata.resource_version))
                    }
                    kube::api::WatchEvent::Error(err) if err.code == CODE_GONE => {
                        Err(WatchError::Desynced(err.message))
                    }
                    kube::api::WatchEvent::Error(err) => Err(WatchError::Transport(err.message)),
                })
            });
        Ok(stream.boxed())
    }

    async fn list_workloads(&self) -> Result<(Vec<WorkloadResource>, String), ApiError> {
        let list = self
            .pods_all()
            .list(&ListParams::default())
            .await
            .map_err(transport)?;
        let token = list.metadata.resource_version.unwrap_or_default();
        let items = list.items.into_iter().filter_map(workload_from_pod).collect();
        Ok((items, token))
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadResource>, ApiError> {
        let pod = self
            .pods_in(namespace)
            .get_opt(name)
            .await
            .map_err(transport)?;
        Ok(pod.and_then(workload_from_pod))
    }

    async fn get_scope(&self, name: &str) -> Result<Option<ScopeResource>, ApiError> {
        let namespace = self.namespaces().get_opt(name).await.map_err(transport)?;
        Ok(namespace.and_then(|ns| {
            let name = ns.metadata.name?;
            Some(ScopeResource {
                name,
                annotations: ns.metadata.annotations,
            })
        }))
    }

    async fn update_workload(
        &self,
        resource: &WorkloadResource,
    ) -> Result<WorkloadResource, UpdateError> {
        // The resourceVersion in the patch body makes the apiserver
        // reject the write with 409 when the token is stale.
        let patch = serde_json::json!({
            "metadata": {
                "annotations": resource.annotations,
                "resourceVersion": resource.resource_version,
            }
        });
        let result = self
            .pods_in(&resource.namespace)
            .patch(&resource.name, &PatchParams::default(), &Patch::Merge(patch))
            .await;
        match result {
            Ok(pod) => workload_from_pod(pod).ok_or_else(|| {
                UpdateError::Api(ApiError("update response missing identity".into()))
            }),
            Err(kube::Error::Api(err)) if err.code == CODE_CONFLICT => Err(UpdateError::Conflict),
            Err(kube::Error::Api(err)) if err.code == CODE_NOT_FOUND => Err(UpdateError::NotFound),
            Err(err) => Err(UpdateError::Api(transport(err))),
        }
    }

    async fn acquire_or_renew_lease(&self, req: &LeaseRequest) -> Result<LeaseGrant, ApiError> {
        let api = self.leases();
        let duration_secs = lease_duration_secs(req.duration);
        let now = MicroTime(Utc::now());

        let Some(mut lease) = api.get_opt(&req.lease_name).await.map_err(transport)? else {
            // No record yet; first creator wins, a create conflict means
            // somebody else just did.
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(req.lease_name.clone()),
                    namespace: Some(self.lease_namespace.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(req.holder.clone()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..LeaseSpec::default()
                }),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(LeaseGrant::Granted),
                Err(kube::Error::Api(err)) if err.code == CODE_CONFLICT => {
                    let holder = api
                        .get_opt(&req.lease_name)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|l| l.spec.and_then(|s| s.holder_identity))
                        .unwrap_or_default();
                    Ok(LeaseGrant::Denied { holder })
                }
                Err(err) => Err(transport(err)),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        let held_by_us = holder == req.holder;
        if !held_by_us && !holder.is_empty() && !lease_expired(&spec, i64::from(duration_secs)) {
            return Ok(LeaseGrant::Denied { holder });
        }

        // Free, expired, or ours: write our claim under the observed
        // resourceVersion so racing claimants collide at the apiserver.
        let spec_mut = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec_mut.renew_time = Some(now.clone());
        spec_mut.lease_duration_seconds = Some(duration_secs);
        if !held_by_us {
            spec_mut.holder_identity = Some(req.holder.clone());
            spec_mut.acquire_time = Some(now);
            spec_mut.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        lease.metadata.managed_fields = None;
        match api
            .replace(&req.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(LeaseGrant::Granted),
            Err(kube::Error::Api(err)) if err.code == CODE_CONFLICT => {
                Ok(LeaseGrant::Denied { holder })
            }
            Err(err) => Err(transport(err)),
        }
    }

    async fn release_lease(&self, lease_name: &str, holder: &str) -> Result<(), ApiError> {
        let api = self.leases();
        let Some(mut lease) = api.get_opt(lease_name).await.map_err(transport)? else {
            return Ok(());
        };
        let held = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(holder);
        if !held {
            return Ok(());
        }
        // An empty holder marks the lease open for immediate acquisition.
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(String::new());
        spec.renew_time = None;
        lease.metadata.managed_fields = None;
        match api.replace(lease_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            // Someone already took over; nothing left to release.
            Err(kube::Error::Api(err)) if err.code == CODE_CONFLICT => Ok(()),
            Err(err) => Err(transport(err)),
        }
    }
}
