//! Per-link lifecycle bookkeeping

use std::fmt;
use std::sync::Arc;

use canary_core::{CanLink, LinkError, LinkStatus};
use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Lifecycle of a managed link as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unopened,
    Configured,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Unopened => "unopened",
            LinkState::Configured => "configured",
            LinkState::Running => "running",
            LinkState::Stopping => "stopping",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one link in a `start_all` / `stop_all` sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerLinkResult {
    pub link: String,
    /// State after the operation
    pub state: LinkState,
    pub error: Option<LinkError>,
    /// `stop` had to abandon the worker after the grace period
    pub forced: bool,
}

impl PerLinkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One adapter instance plus the state the manager tracks for it
pub struct LinkHandle {
    name: String,
    link: Arc<dyn CanLink>,
    state: Mutex<LinkState>,
    last_error: Mutex<Option<LinkError>>,
}

impl LinkHandle {
    pub(crate) fn new(name: &str, link: Arc<dyn CanLink>) -> Self {
        Self {
            name: name.to_string(),
            link,
            state: Mutex::new(LinkState::Unopened),
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &Arc<dyn CanLink> {
        &self.link
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Error behind the most recent transition to `Failed`
    pub fn last_error(&self) -> Option<LinkError> {
        self.last_error.lock().clone()
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    fn result(&self, forced: bool) -> PerLinkResult {
        PerLinkResult {
            link: self.name.clone(),
            state: self.state(),
            error: None,
            forced,
        }
    }

    fn fail(&self, operation: &str, err: LinkError) -> PerLinkResult {
        error!(
            link = %self.name,
            operation,
            category = %err.category(),
            error = %err,
            "Link operation failed"
        );
        self.set_state(LinkState::Failed);
        *self.last_error.lock() = Some(err.clone());
        PerLinkResult {
            link: self.name.clone(),
            state: LinkState::Failed,
            error: Some(err),
            forced: false,
        }
    }

    /// Configure if needed, then start
    pub(crate) async fn start(&self) -> PerLinkResult {
        if self.state() == LinkState::Running {
            warn!(link = %self.name, "Link already running");
            return self.result(false);
        }

        if self.link.status() == LinkStatus::Unconfigured {
            if let Err(e) = self.link.configure().await {
                return self.fail("configure", e);
            }
            self.set_state(LinkState::Configured);
        }

        match self.link.start().await {
            Ok(()) => {
                self.set_state(LinkState::Running);
                *self.last_error.lock() = None;
                info!(link = %self.name, kind = %self.link.backend_kind(), "Link running");
                self.result(false)
            }
            Err(e) => self.fail("start", e),
        }
    }

    pub(crate) async fn stop(&self) -> PerLinkResult {
        if matches!(self.state(), LinkState::Unopened | LinkState::Closed) {
            return self.result(false);
        }

        self.set_state(LinkState::Stopping);
        match self.link.stop().await {
            Ok(outcome) => {
                self.set_state(LinkState::Closed);
                if outcome.forced {
                    warn!(
                        link = %self.name,
                        elapsed_ms = outcome.elapsed.as_millis() as u64,
                        "Link force-closed after grace period"
                    );
                } else {
                    info!(link = %self.name, "Link closed");
                }
                self.result(outcome.forced)
            }
            Err(e) => self.fail("stop", e),
        }
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("name", &self.name)
            .field("kind", &self.link.backend_kind())
            .field("state", &self.state())
            .finish()
    }
}
