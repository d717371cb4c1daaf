//! podstamp — a leader-elected controller that stamps newly created
//! pods in opted-in namespaces with a processing timestamp.
//!
//! One elected replica consumes the cluster change feed; each `Added`
//! pod passes through an [`AdmissionFilter`] (namespace and pod must
//! both opt in via annotation) and, if eligible, gets the configured
//! marker annotation written under optimistic concurrency by the
//! [`Reconciler`]. Leadership is arbitrated through a
//! `coordination.k8s.io` lease so at most one replica writes at a
//! time.
//!
//! The controller is written against the narrow [`ClusterApi`] trait;
//! [`apiserver::ApiServer`] implements it for a real cluster and
//! `mock::MockCluster` (behind the `mock` feature) implements it in
//! memory for the tests.
//!
//! [`AdmissionFilter`]: filter::AdmissionFilter
//! [`Reconciler`]: reconcile::Reconciler
//! [`ClusterApi`]: api::ClusterApi

pub mod api;
pub mod apiserver;
pub mod config;
pub mod controller;
pub mod elector;
pub mod filter;
#[cfg(feature = "mock")]
pub mod mock;
pub mod object;
pub mod reconcile;
pub mod stream;

pub use api::ClusterApi;
pub use config::{ElectionConfig, Settings, StartupPolicy};
pub use controller::Controller;
pub use elector::{LeaderElector, Role};
pub use filter::AdmissionFilter;
pub use reconcile::{AppliedRecord, LogNotifier, Notifier, Reconciler};
