//! Validated controller configuration.
//!
//! All knobs are externally supplied (flags or env in the binary); the
//! library only ever sees the validated structs built here.

use std::time::Duration;

use thiserror::Error;

/// The jitter factor applied to campaign retries.
pub(crate) const JITTER_FACTOR: f64 = 1.2;

/// Configuration error variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with workloads that already exist at controller startup.
///
/// The original behavior here was ambiguous, so the choice is an
/// explicit policy rather than a guess.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StartupPolicy {
    /// Subscribe to future changes only; pre-existing workloads are
    /// never admitted (until they are recreated).
    #[default]
    SkipExisting,
    /// List everything on startup (and after a feed desync) and admit
    /// each existing workload as if it had just been added.
    ProcessExisting,
}

/// Annotation keys and startup policy driving admission and stamping.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace annotation key that opts a scope in.
    pub scope_marker: String,
    /// Pod annotation key that opts an individual workload in.
    pub resource_marker: String,
    /// Annotation key the controller writes its timestamp under.
    pub processed_marker: String,
    /// Treatment of workloads existing before the controller started.
    pub startup_policy: StartupPolicy,
}

impl Settings {
    /// Validates the annotation keys.
    pub fn validate(self) -> Result<Self, Error> {
        for (label, key) in [
            ("scope marker", &self.scope_marker),
            ("resource marker", &self.resource_marker),
            ("processed marker", &self.processed_marker),
        ] {
            if key.is_empty() {
                return Err(Error::Invalid(format!("{label} annotation key may not be empty")));
            }
        }
        if self.processed_marker == self.resource_marker {
            return Err(Error::Invalid(
                "processed marker must differ from the resource marker".into(),
            ));
        }
        Ok(self)
    }
}

/// Leader-election timing and identity.
///
/// Construct via [`ElectionConfig::validate`], which enforces the
/// relationships the safety argument depends on.
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Name of the lease record arbitrating this election scope.
    pub lease_name: String,
    /// Identity of this process instance, unique per replica.
    pub identity: String,
    /// How long the lease stays valid after the last renewal. A
    /// follower may only take over once this has elapsed unrenewed.
    pub lease_duration: Duration,
    /// The leader's renewal budget: failing to renew for this long
    /// demotes the instance to follower.
    pub renew_deadline: Duration,
    /// Period between renewal attempts while leading, and the base
    /// period (jittered) between campaigns while following.
    pub retry_period: Duration,
}

impl ElectionConfig {
    /// Validates field relationships.
    ///
    /// # Errors
    /// Returns [`Error::Invalid`] unless:
    /// - `lease_name` and `identity` are non-empty;
    /// - `lease_duration` > `renew_deadline`;
    /// - `renew_deadline` > `retry_period` × jitter factor;
    /// - every duration is at least one second.
    pub fn validate(self) -> Result<Self, Error> {
        if self.lease_name.is_empty() {
            return Err(Error::Invalid("lease name may not be empty".into()));
        }
        if self.identity.is_empty() {
            return Err(Error::Invalid("identity may not be empty".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Invalid(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline.as_secs_f64() <= JITTER_FACTOR * self.retry_period.as_secs_f64() {
            return Err(Error::Invalid(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        for (label, dur) in [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
        ] {
            if dur < Duration::from_secs(1) {
                return Err(Error::Invalid(format!("{label} must be at least 1 second")));
            }
        }
        Ok(self)
    }
}
