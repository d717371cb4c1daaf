use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use podstamp::apiserver::ApiServer;
use podstamp::{Controller, ElectionConfig, LeaderElector, LogNotifier, Settings, StartupPolicy};

#[derive(Parser)]
#[command(version, about = "Stamps newly created pods in opted-in namespaces")]
struct Opts {
    /// Namespace annotation key that opts a scope in.
    #[arg(long, env = "PODSTAMP_SCOPE_MARKER", default_value = "podstamp.io/managed")]
    scope_marker: String,
    /// Pod annotation key that opts an individual pod in.
    #[arg(long, env = "PODSTAMP_RESOURCE_MARKER", default_value = "podstamp.io/stamp")]
    resource_marker: String,
    /// Annotation key the timestamp is written under.
    #[arg(
        long,
        env = "PODSTAMP_PROCESSED_MARKER",
        default_value = "podstamp.io/processed-at"
    )]
    processed_marker: String,
    /// What to do with pods that already exist at startup.
    #[arg(
        long,
        env = "PODSTAMP_STARTUP_POLICY",
        value_enum,
        default_value_t = StartupPolicy::SkipExisting
    )]
    startup_policy: StartupPolicy,
    /// Name of the election lease record.
    #[arg(long, env = "PODSTAMP_LEASE_NAME", default_value = "podstamp")]
    lease: String,
    /// Namespace the election lease record lives in.
    #[arg(long, env = "PODSTAMP_LEASE_NAMESPACE", default_value = "default")]
    lease_namespace: String,
    /// Identity of this replica; generated when omitted.
    #[arg(long, env = "PODSTAMP_IDENTITY")]
    identity: Option<String>,
    #[arg(long, env = "PODSTAMP_LEASE_DURATION_SECS", default_value_t = 15)]
    lease_duration_secs: u64,
    #[arg(long, env = "PODSTAMP_RENEW_DEADLINE_SECS", default_value_t = 10)]
    renew_deadline_secs: u64,
    #[arg(long, env = "PODSTAMP_RETRY_PERIOD_SECS", default_value_t = 2)]
    retry_period_secs: u64,
}

fn default_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "podstamp".to_string());
    let suffix: u32 = rand::rng().random();
    format!("{host}-{suffix:08x}")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let opts = Opts::parse();

    let settings = Settings {
        scope_marker: opts.scope_marker,
        resource_marker: opts.resource_marker,
        processed_marker: opts.processed_marker,
        startup_policy: opts.startup_policy,
    }
    .validate()?;
    let election = ElectionConfig {
        lease_name: opts.lease,
        identity: opts.identity.unwrap_or_else(default_identity),
        lease_duration: Duration::from_secs(opts.lease_duration_secs),
        renew_deadline: Duration::from_secs(opts.renew_deadline_secs),
        retry_period: Duration::from_secs(opts.retry_period_secs),
    }
    .validate()?;
    tracing::info!(identity = %election.identity, lease = %election.lease_name, "starting");

    let client = kube::Client::try_default().await?;
    let api = Arc::new(ApiServer::new(client, opts.lease_namespace));

    let cancel = CancellationToken::new();
    let (elector, role_rx) = LeaderElector::new(api.clone(), election);
    let controller = Controller::new(api, settings, LogNotifier);
    let elector_task = tokio::spawn(elector.run(cancel.clone()));
    let controller_task = tokio::spawn(controller.run(role_rx, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, releasing lease");
    cancel.cancel();
    let _ = tokio::join!(elector_task, controller_task);
    Ok(())
}
