//! State every adapter keeps: lifecycle status, filter set, callback slot

use std::panic::{catch_unwind, AssertUnwindSafe};

use canary_core::{FilterSet, Frame, FrameCallback, LinkError, LinkStatus};
use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

pub(crate) struct LinkShared {
    name: String,
    status: Mutex<LinkStatus>,
    callback: RwLock<Option<FrameCallback>>,
    filters: RwLock<FilterSet>,
}

impl LinkShared {
    pub(crate) fn new(name: &str, filters: FilterSet) -> Self {
        Self {
            name: name.to_string(),
            status: Mutex::new(LinkStatus::Unconfigured),
            callback: RwLock::new(None),
            filters: RwLock::new(filters),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn require_unconfigured(&self) -> Result<(), LinkError> {
        match self.status() {
            LinkStatus::Unconfigured => Ok(()),
            other => Err(LinkError::State(format!(
                "link {} already configured ({:?})",
                self.name, other
            ))),
        }
    }

    /// Channel open: Configured or Running
    pub(crate) fn require_open(&self) -> Result<(), LinkError> {
        match self.status() {
            LinkStatus::Unconfigured => Err(LinkError::State(format!(
                "link {} is not configured",
                self.name
            ))),
            LinkStatus::Configured | LinkStatus::Running => Ok(()),
        }
    }

    pub(crate) fn set_callback(&self, callback: FrameCallback) {
        *self.callback.write() = Some(callback);
    }

    pub(crate) fn filters(&self) -> FilterSet {
        self.filters.read().clone()
    }

    pub(crate) fn replace_filters(&self, filters: FilterSet) {
        *self.filters.write() = filters;
    }

    /// Swap in `filters` only once `apply` has pushed them to the channel
    ///
    /// On failure the previous set stays in place.
    pub(crate) fn apply_filters<F>(&self, filters: FilterSet, apply: F) -> Result<(), LinkError>
    where
        F: FnOnce(&FilterSet) -> Result<(), LinkError>,
    {
        let mut current = self.filters.write();
        apply(&filters)?;
        *current = filters;
        Ok(())
    }

    /// Apply the filter set and hand the frame to the callback
    ///
    /// A panicking callback is logged and does not propagate into the worker.
    pub(crate) fn dispatch(&self, frame: Frame) {
        if !self.filters.read().accepts(&frame) {
            trace!(link = %self.name, %frame, "Frame rejected by filters");
            return;
        }

        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                    error!(link = %self.name, %frame, "Frame callback panicked");
                }
            }
            None => trace!(link = %self.name, %frame, "No callback registered, frame dropped"),
        }
    }
}
