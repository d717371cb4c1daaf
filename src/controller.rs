//! The leader-gated event loop.

use std::sync::Arc;

use futures::{pin_mut, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::ClusterApi;
use crate::config::Settings;
use crate::elector::Role;
use crate::filter::AdmissionFilter;
use crate::object::{EventPayload, WorkloadResource};
use crate::reconcile::{Applied, Notifier, Reconciler};
use crate::stream::{workload_events, Event};

/// Consumes the change feed while this instance leads, admitting each
/// newly created workload and stamping the eligible ones.
///
/// `Modified` and `Deleted` events are deliberately ignored; only
/// creations (and resync listings, which stand in for creations the
/// feed lost) are acted on.
pub struct Controller<C, N> {
    api: Arc<C>,
    settings: Settings,
    filter: AdmissionFilter,
    reconciler: Reconciler<C>,
    notifier: N,
    skipped_unrecognized: u64,
}

impl<C: ClusterApi, N: Notifier> Controller<C, N> {
    /// Wires the filter and reconciler from validated settings.
    pub fn new(api: Arc<C>, settings: Settings, notifier: N) -> Self {
        let filter = AdmissionFilter::new(&settings);
        let reconciler = Reconciler::new(api.clone(), settings.processed_marker.clone());
        Self {
            api,
            settings,
            filter,
            reconciler,
            notifier,
            skipped_unrecognized: 0,
        }
    }

    /// Runs until cancelled. Consumes events only while the role
    /// channel reads [`Role::Leader`]; on demotion the watch is dropped
    /// and reopened fresh at the next promotion.
    pub async fn run(mut self, mut role_rx: watch::Receiver<Role>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                leader = role_rx.wait_for(|role| *role == Role::Leader) => {
                    if leader.is_err() {
                        // Elector gone; nothing can promote us again.
                        return;
                    }
                }
            }
            tracing::info!("leading, opening workload watch");

            let events = workload_events(self.api.clone(), self.settings.startup_policy);
            pin_mut!(events);
            loop {
                // Biased: a demotion already on the channel must win
                // over any buffered stream item, so no event admitted
                // after leadership was lost.
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    changed = role_rx.changed() => {
                        match changed {
                            Ok(()) if *role_rx.borrow_and_update() == Role::Leader => {}
                            Ok(()) => {
                                tracing::info!("leadership lost, releasing workload watch");
                                break;
                            }
                            Err(_) => return,
                        }
                    }
                    item = events.next() => match item {
                        Some(Ok(event)) => self.handle(event).await,
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "watch interrupted, recovering");
                        }
                        // The stream is unbounded; treat closure like a
                        // demotion and reopen on the next promotion.
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Added(payload) => self.admit(payload).await,
            Event::Resynced(items) => {
                tracing::info!(count = items.len(), "feed resynced, re-admitting listing");
                for item in items {
                    self.admit_workload(item).await;
                }
            }
            Event::Modified(_) | Event::Deleted(_) => {}
        }
    }

    async fn admit(&mut self, payload: EventPayload) {
        match payload {
            EventPayload::Workload(workload) => self.admit_workload(*workload).await,
            EventPayload::Unrecognized { kind } => {
                self.skipped_unrecognized += 1;
                tracing::debug!(
                    %kind,
                    total = self.skipped_unrecognized,
                    "skipping unrecognized payload"
                );
            }
        }
    }

    async fn admit_workload(&mut self, workload: WorkloadResource) {
        let scope = match self.api.get_scope(&workload.namespace).await {
            Ok(Some(scope)) => scope,
            Ok(None) => {
                tracing::debug!(namespace = %workload.namespace, "scope missing, skipping");
                return;
            }
            Err(err) => {
                tracing::warn!(
                    namespace = %workload.namespace,
                    error = %err,
                    "scope lookup failed, skipping event"
                );
                return;
            }
        };
        if !self.filter.is_eligible(&workload, &scope) {
            tracing::debug!(
                namespace = %workload.namespace,
                name = %workload.name,
                "not opted in, skipping"
            );
            return;
        }
        match self.reconciler.apply(&workload).await {
            Ok(Applied::Stamped(record)) => self.notifier.applied(&record),
            Ok(Applied::Gone) => {
                tracing::debug!(
                    namespace = %workload.namespace,
                    name = %workload.name,
                    "workload vanished before stamping"
                );
            }
            Err(err) => {
                tracing::warn!(
                    namespace = %workload.namespace,
                    name = %workload.name,
                    error = %err,
                    "reconciliation failed, continuing"
                );
            }
        }
    }
}
