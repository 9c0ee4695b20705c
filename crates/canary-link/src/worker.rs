//! Background workers with cooperative cancellation and bounded join
//!
//! Device-backed links (SocketCAN, slcan) run one blocking receive loop
//! each. The loop polls its [`FrameSource`] with a short timeout so the
//! cancellation token is observed at bounded intervals, and it never
//! returns early on transport errors: they are logged and followed by a
//! short backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use canary_core::{Frame, LinkError, StopOutcome};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::shared::LinkShared;

/// Poll timeout of device receive loops
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a transport error before polling again
pub const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Blocking source of frames owned by a receive loop
pub(crate) trait FrameSource: Send + 'static {
    /// Wait up to `timeout` for the next frame; `Ok(None)` when nothing arrived
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError>;
}

/// Handle to one or more background tasks sharing a cancellation token
pub(crate) struct Worker {
    link: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(link: &str, token: CancellationToken, handles: Vec<JoinHandle<()>>) -> Self {
        Self {
            link: link.to_string(),
            token,
            handles,
        }
    }

    /// Run `source` on a blocking thread, dispatching through `shared`
    pub(crate) fn spawn_receive_loop<S: FrameSource>(shared: Arc<LinkShared>, source: S) -> Self {
        let token = CancellationToken::new();
        let link = shared.name().to_string();
        let handle = tokio::task::spawn_blocking({
            let token = token.clone();
            move || receive_loop(shared, source, token)
        });
        Self::new(&link, token, vec![handle])
    }

    /// Signal cancellation without waiting
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Signal cancellation and wait at most `grace` for every task
    ///
    /// Tasks still running at the deadline are aborted (async) or
    /// detached (blocking) and the outcome is marked as forced.
    pub(crate) async fn stop(mut self, grace: Duration) -> StopOutcome {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + grace;
        self.token.cancel();

        let mut forced = false;
        for handle in self.handles.iter_mut() {
            match tokio::time::timeout_at(deadline, &mut *handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(link = %self.link, error = %e, "Worker ended abnormally");
                }
                Err(_) => {
                    handle.abort();
                    forced = true;
                }
            }
        }

        let elapsed = started.elapsed();
        if forced {
            warn!(
                link = %self.link,
                grace_ms = grace.as_millis() as u64,
                "Worker did not stop within grace period, forcing close"
            );
            StopOutcome::forced(elapsed)
        } else {
            debug!(link = %self.link, elapsed_ms = elapsed.as_millis() as u64, "Worker stopped");
            StopOutcome::clean(elapsed)
        }
    }
}

fn receive_loop<S: FrameSource>(shared: Arc<LinkShared>, mut source: S, token: CancellationToken) {
    debug!(link = %shared.name(), "Receive loop started");

    while !token.is_cancelled() {
        match source.poll(POLL_TIMEOUT) {
            Ok(Some(frame)) => {
                trace!(link = %shared.name(), %frame, "Frame received");
                shared.dispatch(frame);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(link = %shared.name(), error = %e, "Receive error, backing off");
                backoff(&token, ERROR_BACKOFF);
            }
        }
    }

    debug!(link = %shared.name(), "Receive loop stopped");
}

fn backoff(token: &CancellationToken, total: Duration) {
    let step = Duration::from_millis(10);
    let deadline = Instant::now() + total;
    while !token.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(step));
    }
}
