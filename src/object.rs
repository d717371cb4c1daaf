//! Domain projections of the cluster objects the controller touches.
//!
//! The controller never owns cluster state; these types are transient
//! read-then-write copies. The platform boundary ([`crate::apiserver`]
//! or the feature-gated `crate::mock`) decodes raw payloads into
//! [`EventPayload`] so the event loop only ever sees a tagged variant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A pod, reduced to the fields the controller reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadResource {
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Pod name, unique within the namespace.
    pub name: String,
    /// Annotation mapping. `None` means the object carries no
    /// annotations at all, which is distinct from an empty map and must
    /// never fault downstream consumers.
    pub annotations: Option<BTreeMap<String, String>>,
    /// Opaque concurrency token (`resourceVersion`); changes on every
    /// server-side mutation and is submitted back on update so the
    /// apiserver can reject lost-update writes.
    pub resource_version: Option<String>,
}

impl WorkloadResource {
    /// Looks up an annotation value, treating an absent mapping as empty.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    /// Sets an annotation, creating the mapping if the object had none.
    pub fn set_annotation(&mut self, key: &str, value: String) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
    }
}

/// A namespace, read-only from the controller's perspective.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeResource {
    /// Namespace name.
    pub name: String,
    /// Annotation mapping, `None` when the namespace has no annotations.
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ScopeResource {
    /// Looks up an annotation value, treating an absent mapping as empty.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

/// The result of decoding a watch payload at the platform boundary.
///
/// Watch feeds may carry heterogeneous payloads; anything that does not
/// decode into a [`WorkloadResource`] surfaces as [`Unrecognized`] and
/// is skipped by the event loop rather than treated as an error.
///
/// [`Unrecognized`]: EventPayload::Unrecognized
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// A pod payload that decoded cleanly.
    Workload(Box<WorkloadResource>),
    /// A payload of some other kind, or one missing mandatory identity.
    Unrecognized {
        /// Best-effort description of what the payload claimed to be.
        kind: String,
    },
}

/// A single unit of the live change feed.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// An object was created.
    Added(EventPayload),
    /// An object was mutated. Ignored by the event loop.
    Modified(EventPayload),
    /// An object was deleted. Ignored by the event loop.
    Deleted(EventPayload),
    /// The feed advanced its resumption token without object changes.
    Bookmark(String),
}
