//! Self-healing subscription over the platform change feed.
//!
//! [`workload_events`] wraps [`ClusterApi::watch`] in a finite state
//! machine that survives transport disconnects (reopen at the last
//! good token, exponential backoff) and feed desyncs (full relist or
//! reset-to-future, depending on the startup policy). Errors are still
//! surfaced as stream items so the consumer can log them, but the
//! stream itself never terminates.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{stream, Stream, StreamExt};

use crate::api::{ClusterApi, EventStream, WatchError};
use crate::config::StartupPolicy;
use crate::object::{EventPayload, WatchEvent, WorkloadResource};

/// Events delivered to the event loop.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// An object was created.
    Added(EventPayload),
    /// An object was mutated.
    Modified(EventPayload),
    /// An object was deleted.
    Deleted(EventPayload),
    /// The feed position was lost and all currently-existing workloads
    /// were relisted; consumers should admit each as if newly added.
    Resynced(Vec<WorkloadResource>),
}

/// The internal finite state machine driving [`workload_events`].
enum State {
    /// Nothing started yet; the first step picks the entry point for
    /// the configured startup policy.
    Init,
    /// A full relist is pending; its token seeds the next watch.
    Listing,
    /// The next step opens the feed at the carried resumption token.
    Starting { token: Option<String> },
    /// The feed is live; steps pull events from it.
    Watching {
        token: Option<String>,
        stream: EventStream,
    },
}

struct Machine<C> {
    api: Arc<C>,
    policy: StartupPolicy,
    backoff: Option<ExponentialBackoff>,
    pending_backoff: bool,
}

impl<C: ClusterApi> Machine<C> {
    fn new(api: Arc<C>, policy: StartupPolicy) -> Self {
        Self {
            api,
            policy,
            backoff: None,
            pending_backoff: false,
        }
    }

    /// Where to go when the feed position is no longer valid.
    fn reset_state(&self) -> State {
        match self.policy {
            StartupPolicy::ProcessExisting => State::Listing,
            StartupPolicy::SkipExisting => State::Starting { token: None },
        }
    }

    fn note_error(&mut self) {
        self.pending_backoff = true;
    }

    fn note_healthy(&mut self) {
        self.backoff = None;
        self.pending_backoff = false;
    }

    /// Sleeps out the current backoff interval if the previous step
    /// failed. Called at the top of every step so the pause lands
    /// before the retry rather than before the error is delivered.
    async fn maybe_pause(&mut self) {
        if !self.pending_backoff {
            return;
        }
        self.pending_backoff = false;
        let backoff = self.backoff.get_or_insert_with(|| {
            ExponentialBuilder::default()
                .with_min_delay(std::time::Duration::from_millis(500))
                .with_max_delay(std::time::Duration::from_secs(30))
                .without_max_times()
                .build()
        });
        if let Some(delay) = backoff.next() {
            tracing::debug!(?delay, "backing off before retrying watch");
            tokio::time::sleep(delay).await;
        }
    }

    /// Progresses the machine a single step, returning `(item, state)`.
    ///
    /// A `None` item means "step again"; the caller trampolines until
    /// an item is produced.
    async fn step(&mut self, state: State) -> (Option<Result<Event, WatchError>>, State) {
        self.maybe_pause().await;
        match state {
            State::Init => (None, self.reset_state()),
            State::Listing => match self.api.list_workloads().await {
                Ok((items, token)) => {
                    self.note_healthy();
                    (Some(Ok(Event::Resynced(items))), State::Starting {
                        token: Some(token),
                    })
                }
                Err(err) => {
                    self.note_error();
                    (Some(Err(WatchError::Transport(err.0))), State::Listing)
                }
            },
            State::Starting { token } => match self.api.watch(token.as_deref()).await {
                Ok(stream) => (None, State::Watching { token, stream }),
                Err(err) => {
                    self.note_error();
                    (Some(Err(WatchError::Transport(err.0))), State::Starting { token })
                }
            },
            State::Watching { token, mut stream } => match stream.next().await {
                Some(Ok(event)) => {
                    self.note_healthy();
                    let token = advance_token(token, &event);
                    match event {
                        WatchEvent::Added(p) => {
                            (Some(Ok(Event::Added(p))), State::Watching { token, stream })
                        }
                        WatchEvent::Modified(p) => {
                            (Some(Ok(Event::Modified(p))), State::Watching { token, stream })
                        }
                        WatchEvent::Deleted(p) => {
                            (Some(Ok(Event::Deleted(p))), State::Watching { token, stream })
                        }
                        WatchEvent::Bookmark(_) => (None, State::Watching { token, stream }),
                    }
                }
                Some(Err(err @ WatchError::Desynced(_))) => {
                    // The position is gone for good; resume per policy.
                    self.note_error();
                    (Some(Err(err)), self.reset_state())
                }
                Some(Err(err)) => {
                    self.note_error();
                    (Some(Err(err)), State::Starting { token })
                }
                None => {
                    // Transport-level closure without a terminal event.
                    self.note_error();
                    (None, State::Starting { token })
                }
            },
        }
    }
}

/// Tracks the most recent resumption token seen on the feed.
fn advance_token(token: Option<String>, event: &WatchEvent) -> Option<String> {
    let payload = match event {
        WatchEvent::Bookmark(t) => return Some(t.clone()),
        WatchEvent::Added(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
    };
    match payload {
        EventPayload::Workload(w) => w.resource_version.clone().or(token),
        EventPayload::Unrecognized { .. } => token,
    }
}

/// Watches workload resources continuously.
///
/// Compared to [`ClusterApi::watch`], this automatically recovers the
/// stream upon errors; it never terminates.
pub fn workload_events<C: ClusterApi>(
    api: Arc<C>,
    policy: StartupPolicy,
) -> impl Stream<Item = Result<Event, WatchError>> + Send {
    stream::unfold(
        (Machine::new(api, policy), State::Init),
        |(mut machine, mut state)| async {
            loop {
                let (item, next) = machine.step(state).await;
                state = next;
                if let Some(item) = item {
                    return Some((item, (machine, state)));
                }
            }
        },
    )
}
