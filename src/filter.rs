//! The admission predicate gating which workloads get stamped.

use crate::config::Settings;
use crate::object::{ScopeResource, WorkloadResource};

/// Pure opt-in predicate over a workload and its enclosing scope.
///
/// Performs no I/O and never faults: a missing annotation mapping on
/// either side simply yields `false`.
#[derive(Clone, Debug)]
pub struct AdmissionFilter {
    scope_marker: String,
    resource_marker: String,
}

impl AdmissionFilter {
    /// Builds the filter from validated settings.
    pub fn new(settings: &Settings) -> Self {
        Self {
            scope_marker: settings.scope_marker.clone(),
            resource_marker: settings.resource_marker.clone(),
        }
    }

    /// True iff both the scope and the workload carry their opt-in
    /// annotation with a non-empty value.
    pub fn is_eligible(&self, resource: &WorkloadResource, scope: &ScopeResource) -> bool {
        let scope_opted = scope
            .annotation(&self.scope_marker)
            .is_some_and(|v| !v.is_empty());
        let resource_opted = resource
            .annotation(&self.resource_marker)
            .is_some_and(|v| !v.is_empty());
        scope_opted && resource_opted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartupPolicy;

    fn filter() -> AdmissionFilter {
        AdmissionFilter::new(
            &Settings {
                scope_marker: "podstamp.io/managed".into(),
                resource_marker: "podstamp.io/stamp".into(),
                processed_marker: "podstamp.io/processed-at".into(),
                startup_policy: StartupPolicy::SkipExisting,
            }
            .validate()
            .unwrap(),
        )
    }

    fn scope(annotated: bool) -> ScopeResource {
        ScopeResource {
            name: "team-a".into(),
            annotations: annotated
                .then(|| [("podstamp.io/managed".to_string(), "true".to_string())].into()),
        }
    }

    fn workload(annotated: bool) -> WorkloadResource {
        WorkloadResource {
            namespace: "team-a".into(),
            name: "web-0".into(),
            annotations: annotated
                .then(|| [("podstamp.io/stamp".to_string(), "true".to_string())].into()),
            resource_version: Some("1".into()),
        }
    }

    #[test]
    fn truth_table() {
        let f = filter();
        for scope_opted in [true, false] {
            for resource_opted in [true, false] {
                let eligible = f.is_eligible(&workload(resource_opted), &scope(scope_opted));
                assert_eq!(eligible, scope_opted && resource_opted);
            }
        }
    }

    #[test]
    fn absent_mappings_are_false_not_faults() {
        let f = filter();
        assert!(!f.is_eligible(&workload(false), &scope(false)));
        assert!(!f.is_eligible(&workload(true), &scope(false)));
    }

    #[test]
    fn empty_values_do_not_opt_in() {
        let f = filter();
        let mut r = workload(true);
        r.set_annotation("podstamp.io/stamp", String::new());
        assert!(!f.is_eligible(&r, &scope(true)));
    }
}
