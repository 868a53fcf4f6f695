//! A single viewer's playback of a single asset, kept supplied with a live
//! signed handle for as long as the entitlement allows.
//!
//! The session owns one background task. That task holds the only rotation
//! timer, makes at most one gate call at a time, and stops the moment the
//! session is stopped or dropped. Everything it learns is published through
//! a `watch` channel (current state) and an event stream.

use super::client::AccessClient;
use super::schedule::RotationPolicy;
use super::surface::{Playhead, PlaybackSurface};
use crate::entitlement::AssetId;
use crate::error::AccessError;
use crate::issuer::SignedHandle;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Slack past a lapsing entitlement before asking the gate again.
const LAPSE_MARGIN: Duration = Duration::from_millis(1);

/// Why a session stopped rotating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The gate said no: entitlement lapsed or the session lost its login.
    Denied(AccessError),
    /// Transient failures outlasted the retry budget.
    RetriesExhausted(AccessError),
}

impl EndReason {
    pub fn error(&self) -> &AccessError {
        match self {
            EndReason::Denied(error) | EndReason::RetriesExhausted(error) => error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Playing from this handle, next rotation scheduled.
    Active(SignedHandle),
    /// A rotation call is in flight; the handle is the one still in use.
    Rotating(SignedHandle),
    /// Terminal: the viewer no longer has access.
    AccessEnded(EndReason),
    /// Terminal: torn down by the owner.
    Stopped,
}

impl SessionState {
    pub fn handle(&self) -> Option<&SignedHandle> {
        match self {
            SessionState::Active(handle) | SessionState::Rotating(handle) => Some(handle),
            SessionState::AccessEnded(_) | SessionState::Stopped => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::AccessEnded(_) | SessionState::Stopped)
    }
}

/// What the UI hears about. `AccessEnded` and `MediaError` are distinct on
/// purpose: only the former means the viewer lost access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    HandleAdopted(SignedHandle),
    RotationRetry {
        attempt: u32,
        delay: Duration,
        error: AccessError,
    },
    AccessEnded(EndReason),
    MediaError(String),
}

pub struct PlaybackSession {
    asset_id: AssetId,
    state: watch::Receiver<SessionState>,
    events: Option<UnboundedReceiver<PlaybackEvent>>,
    refresh: Arc<Notify>,
    rotating: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    /// Ask the gate for a first handle and start rotating.
    ///
    /// A refusal here is returned as-is and never retried: the caller
    /// decides whether a fresh request is worth another try. The first
    /// source load runs in the background alongside the rotation timer.
    pub async fn start(
        client: Arc<dyn AccessClient>,
        surface: Arc<dyn PlaybackSurface>,
        asset_id: AssetId,
        policy: RotationPolicy,
    ) -> Result<Self, AccessError> {
        let requested = Instant::now();
        let handle = client.request_access(&asset_id).await?;
        info!(%asset_id, expires_at = %handle.expires_at, "Playback session started");

        let (event_tx, event_rx) = unbounded();
        _ = event_tx.unbounded_send(PlaybackEvent::HandleAdopted(handle.clone()));

        let (state_tx, state_rx) = watch::channel(SessionState::Active(handle.clone()));
        let refresh = Arc::new(Notify::new());
        let rotating = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let rotator = Rotator {
            client,
            surface,
            asset_id: asset_id.clone(),
            policy,
            state_tx,
            event_tx,
            refresh: refresh.clone(),
            rotating: rotating.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(rotator.run(handle, requested));

        Ok(Self {
            asset_id,
            state: state_rx,
            events: Some(event_rx),
            refresh,
            rotating,
            cancel,
            task: Some(task),
        })
    }

    pub fn asset_id(&self) -> &AssetId {
        &self.asset_id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn current_handle(&self) -> Option<SignedHandle> {
        self.state.borrow().handle().cloned()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Take the event stream. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<PlaybackEvent>> {
        self.events.take()
    }

    /// Rotate now instead of waiting for the timer.
    ///
    /// Returns `false` without doing anything while a rotation is already in
    /// flight or once the session has ended.
    pub fn refresh(&self) -> bool {
        if self.rotating.load(Ordering::SeqCst) || self.state.borrow().is_terminal() {
            return false;
        }
        self.refresh.notify_one();
        true
    }

    /// Resolve once the session reaches a terminal state.
    pub async fn wait_until_ended(&self) -> SessionState {
        let mut state = self.state.clone();
        match state.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Tear the session down. No gate call is made after this returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            _ = task.await;
        }
        debug!(asset_id = %self.asset_id, "Playback session stopped");
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Rotator {
    client: Arc<dyn AccessClient>,
    surface: Arc<dyn PlaybackSurface>,
    asset_id: AssetId,
    policy: RotationPolicy,
    state_tx: watch::Sender<SessionState>,
    event_tx: UnboundedSender<PlaybackEvent>,
    refresh: Arc<Notify>,
    rotating: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// How a rotation ended.
enum Rotation {
    /// The new handle and when the call that produced it was sent.
    Granted(SignedHandle, Instant),
    Ended(EndReason),
    Cancelled,
}

/// The source load in progress, if any.
///
/// A newer handle replaces a pending load outright. The playhead captured
/// by the first swap is kept, since the interrupted load may already have
/// reset the element.
struct SourceLoad {
    pending: Option<BoxFuture<'static, anyhow::Result<()>>>,
    playhead: Option<Playhead>,
}

impl SourceLoad {
    /// First load of a session: nothing to restore afterwards.
    fn initial(surface: &Arc<dyn PlaybackSurface>, url: &str) -> Self {
        Self {
            pending: Some(Self::begin(surface, url)),
            playhead: None,
        }
    }

    fn swap(&mut self, surface: &Arc<dyn PlaybackSurface>, url: &str) {
        if self.pending.is_none() {
            self.playhead = Some(Playhead::capture(surface.as_ref()));
        }
        self.pending = Some(Self::begin(surface, url));
    }

    fn begin(
        surface: &Arc<dyn PlaybackSurface>,
        url: &str,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let surface = surface.clone();
        let url = url.to_string();
        Box::pin(async move { surface.load_source(&url).await })
    }

    /// Resolve when the pending load finishes; never while idle.
    async fn settled(&mut self) -> anyhow::Result<()> {
        match self.pending.as_mut() {
            Some(load) => load.await,
            None => std::future::pending().await,
        }
    }
}

impl Rotator {
    async fn run(self, mut handle: SignedHandle, mut requested: Instant) {
        let mut load = SourceLoad::initial(&self.surface, &handle.url);

        loop {
            // Measured from when the request left, so the gate round trip
            // and any source loading come out of the handle's lifetime.
            let due = requested + self.policy.rotation_delay(handle.lifetime());
            debug!(asset_id = %self.asset_id, expires_at = %handle.expires_at, "Next rotation scheduled");

            let woken = self
                .drive(&mut load, async {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.refresh.notified() => {
                            debug!(asset_id = %self.asset_id, "Rotation requested");
                        }
                    }
                })
                .await;
            if woken.is_none() {
                break;
            }

            self.rotating.store(true, Ordering::SeqCst);
            self.state_tx
                .send_replace(SessionState::Rotating(handle.clone()));
            let rotation = self.rotate(&mut load).await;
            self.rotating.store(false, Ordering::SeqCst);

            match rotation {
                Rotation::Granted(next, sent) => {
                    self.adopt(&mut load, &next);
                    handle = next;
                    requested = sent;
                }
                Rotation::Ended(reason) => {
                    info!(
                        asset_id = %self.asset_id,
                        error = %reason.error(),
                        "Access ended"
                    );
                    self.state_tx
                        .send_replace(SessionState::AccessEnded(reason.clone()));
                    _ = self
                        .event_tx
                        .unbounded_send(PlaybackEvent::AccessEnded(reason));
                    return;
                }
                Rotation::Cancelled => break,
            }
        }

        self.state_tx.send_replace(SessionState::Stopped);
    }

    /// Run `fut` to completion while finishing source loads in the
    /// background. `None` if the session was cancelled first.
    async fn drive<F: Future>(&self, load: &mut SourceLoad, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = load.settled() => self.loaded(load, result),
                output = &mut fut => return Some(output),
            }
        }
    }

    /// One gate call, then bounded retries on transient failures.
    async fn rotate(&self, load: &mut SourceLoad) -> Rotation {
        let mut attempt = 0;

        loop {
            let sent = Instant::now();
            let Some(result) = self
                .drive(load, self.client.request_access(&self.asset_id))
                .await
            else {
                return Rotation::Cancelled;
            };

            let error = match result {
                Ok(handle) => return Rotation::Granted(handle, sent),
                Err(AccessError::Lapsing(remaining)) => {
                    // Still entitled, but only for less than a URL can say.
                    // Ask again once the entitlement has run out.
                    debug!(asset_id = %self.asset_id, ?remaining, "Entitlement about to lapse");
                    let wait = tokio::time::sleep(remaining.max(LAPSE_MARGIN));
                    if self.drive(load, wait).await.is_none() {
                        return Rotation::Cancelled;
                    }
                    continue;
                }
                Err(error) if !error.is_transient() => {
                    return Rotation::Ended(EndReason::Denied(error));
                }
                Err(error) => error,
            };

            if attempt >= self.policy.max_retries() {
                return Rotation::Ended(EndReason::RetriesExhausted(error));
            }
            attempt += 1;

            let delay = self.policy.backoff(attempt);
            warn!(asset_id = %self.asset_id, attempt, ?delay, %error, "Rotation failed, retrying");
            _ = self.event_tx.unbounded_send(PlaybackEvent::RotationRetry {
                attempt,
                delay,
                error,
            });

            if self.drive(load, tokio::time::sleep(delay)).await.is_none() {
                return Rotation::Cancelled;
            }
        }
    }

    /// Make `handle` current and start loading it into the surface.
    fn adopt(&self, load: &mut SourceLoad, handle: &SignedHandle) {
        debug!(asset_id = %self.asset_id, expires_at = %handle.expires_at, "Handle rotated");
        self.state_tx
            .send_replace(SessionState::Active(handle.clone()));
        _ = self
            .event_tx
            .unbounded_send(PlaybackEvent::HandleAdopted(handle.clone()));
        load.swap(&self.surface, &handle.url);
    }

    fn loaded(&self, load: &mut SourceLoad, result: anyhow::Result<()>) {
        load.pending = None;
        let playhead = load.playhead.take();

        match result {
            Ok(()) => {
                if let Some(playhead) = playhead {
                    playhead.restore(self.surface.as_ref());
                }
            }
            Err(error) => {
                warn!(asset_id = %self.asset_id, ?error, "Source failed to load");
                _ = self
                    .event_tx
                    .unbounded_send(PlaybackEvent::MediaError(error.to_string()));
            }
        }
    }
}
