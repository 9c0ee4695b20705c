//! The CanLink trait
//!
//! Every backend (native controller, serial bridge, virtual bus) implements
//! this trait. Callers never see backend-specific framing; they exchange
//! validated [`Frame`] values only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::error::LinkResult;
use crate::filter::{FilterRule, FilterSet};
use crate::frame::Frame;

/// Callback invoked by a link's receive worker for every accepted frame
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Link-internal lifecycle as reported by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Channel closed
    Unconfigured,
    /// Channel open, filters applied, receive worker not running
    Configured,
    /// Receive worker running
    Running,
}

/// Result of a `stop()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// The worker did not finish within the grace period and was abandoned
    pub forced: bool,
    /// Time spent waiting for the worker
    pub elapsed: Duration,
}

impl StopOutcome {
    pub fn clean(elapsed: Duration) -> Self {
        Self {
            forced: false,
            elapsed,
        }
    }

    pub fn forced(elapsed: Duration) -> Self {
        Self {
            forced: true,
            elapsed,
        }
    }
}

/// Uniform interface over CAN backends
#[async_trait]
pub trait CanLink: Send + Sync {
    /// Channel identifier this link was built for
    fn name(&self) -> &str;

    fn backend_kind(&self) -> BackendKind;

    fn status(&self) -> LinkStatus;

    /// Register the single consumer of received frames, replacing any previous one
    fn set_callback(&self, callback: FrameCallback);

    /// Currently applied filter set
    fn filters(&self) -> FilterSet;

    /// Open the channel at the configured bitrate and apply filters
    ///
    /// Only valid while unconfigured; a second call is a state error.
    async fn configure(&self) -> LinkResult<()>;

    /// Start the receive worker. Already running is a no-op.
    async fn start(&self) -> LinkResult<()>;

    /// Signal the worker, wait at most the grace period, release the channel
    ///
    /// Never blocks longer than the grace period. A worker that does not
    /// finish in time is abandoned and reported through `StopOutcome::forced`.
    async fn stop(&self) -> LinkResult<StopOutcome>;

    /// Write one frame
    ///
    /// Transient transport failures come back as `LinkError::Transport`.
    async fn send(&self, frame: Frame) -> LinkResult<()>;

    /// Atomically replace the filter set
    ///
    /// On failure the previous set stays active.
    async fn set_filters(&self, rules: Vec<FilterRule>) -> LinkResult<()>;
}
