//! Lease-based leader election.
//!
//! One elector task runs per process instance and publishes its
//! [`Role`] over a `tokio::sync::watch` channel; the event loop only
//! consumes events while the channel reads [`Role::Leader`]. Demotion
//! is published synchronously before the elector does anything else,
//! which is the ordering the at-most-one-writer argument rests on.
//!
//! Timing follows the upstream client-go leader election scheme: the
//! leader renews every `retry_period` and gives up after failing to
//! renew for `renew_deadline`; followers campaign on a jittered
//! `retry_period` and are only granted the lease once it has sat
//! unrenewed for `lease_duration`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::api::{ClusterApi, LeaseGrant, LeaseRequest};
use crate::config::{ElectionConfig, JITTER_FACTOR};

/// Leadership role of this process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Starting up; no verdict on the lease yet.
    Candidate,
    /// Another instance holds the lease.
    Follower,
    /// This instance holds the lease and may reconcile.
    Leader,
}

/// The elector task.
pub struct LeaderElector<C> {
    api: Arc<C>,
    config: ElectionConfig,
    role_tx: watch::Sender<Role>,
    last_renewal: Option<Instant>,
}

impl<C: ClusterApi> LeaderElector<C> {
    /// Creates the elector and the role channel it will publish on.
    pub fn new(api: Arc<C>, config: ElectionConfig) -> (Self, watch::Receiver<Role>) {
        let (role_tx, role_rx) = watch::channel(Role::Candidate);
        (
            Self {
                api,
                config,
                role_tx,
                last_renewal: None,
            },
            role_rx,
        )
    }

    /// Runs campaign/renew cycles until cancelled, releasing the lease
    /// on the way out if this instance holds it. Every lease call is
    /// raced against the token, so a hung platform call cannot stall
    /// shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "leader elector started"
        );
        let mut first = true;
        loop {
            let delay = if first { Duration::ZERO } else { self.next_delay() };
            first = false;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.step() => {}
            }
        }

        if self.is_leader() {
            // Demote before the release write so no reconciliation can
            // race the handover.
            self.demote();
            let release = self
                .api
                .release_lease(&self.config.lease_name, &self.config.identity);
            // Time-bounded: the lease expires on its own if this write
            // cannot go through.
            match timeout(self.config.retry_period, release).await {
                Ok(Ok(())) => tracing::info!("released lease"),
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "failed to release lease on shutdown");
                }
                Err(_) => tracing::warn!("lease release timed out on shutdown"),
            }
        }
        tracing::info!("leader elector stopped");
    }

    async fn step(&mut self) {
        if self.is_leader() {
            self.renew().await;
        } else {
            self.campaign().await;
        }
    }

    fn is_leader(&self) -> bool {
        matches!(*self.role_tx.borrow(), Role::Leader)
    }

    fn lease_request(&self) -> LeaseRequest {
        LeaseRequest {
            lease_name: self.config.lease_name.clone(),
            holder: self.config.identity.clone(),
            duration: self.config.lease_duration,
        }
    }

    /// Attempts to take (or observe) the lease while not leading.
    async fn campaign(&mut self) {
        match self.api.acquire_or_renew_lease(&self.lease_request()).await {
            Ok(LeaseGrant::Granted) => {
                self.last_renewal = Some(Instant::now());
                tracing::info!(identity = %self.config.identity, "acquired lease, promoting");
                self.role_tx.send_replace(Role::Leader);
            }
            Ok(LeaseGrant::Denied { holder }) => {
                tracing::debug!(%holder, "lease held elsewhere, following");
                self.role_tx.send_replace(Role::Follower);
            }
            Err(err) => {
                // Transient; stay in the current role and retry.
                tracing::warn!(error = %err, "campaign attempt failed");
            }
        }
    }

    /// Extends the lease while leading. Exhausting the renewal budget
    /// demotes this instance before anything else happens.
    async fn renew(&mut self) {
        match self.api.acquire_or_renew_lease(&self.lease_request()).await {
            Ok(LeaseGrant::Granted) => {
                self.last_renewal = Some(Instant::now());
                tracing::trace!("lease renewed");
            }
            Ok(LeaseGrant::Denied { holder }) => {
                tracing::warn!(%holder, "lease taken over, demoting");
                self.demote();
            }
            Err(err) => {
                let since_renewal = self
                    .last_renewal
                    .map_or(Duration::MAX, |at| at.elapsed());
                if since_renewal >= self.config.renew_deadline {
                    tracing::warn!(
                        error = %err,
                        ?since_renewal,
                        "renewal budget exhausted, demoting"
                    );
                    self.demote();
                } else {
                    tracing::warn!(error = %err, "lease renewal failed, will retry");
                }
            }
        }
    }

    /// Publishes loss of leadership. The send is synchronous, so the
    /// event loop observes it before the elector proceeds.
    fn demote(&mut self) {
        self.last_renewal = None;
        self.role_tx.send_replace(Role::Follower);
    }

    /// Delay before the next campaign or renewal attempt.
    fn next_delay(&self) -> Duration {
        if self.is_leader() {
            self.config.retry_period
        } else {
            // Jitter follower campaigns to avoid thundering-herd on the
            // lease record.
            let factor = rand::rng().random_range(1.0..JITTER_FACTOR);
            self.config.retry_period.mul_f64(factor)
        }
    }
}
