//! Integration tests for the canary CAN simulator
//!
//! Everything here runs against the virtual bus, so no CAN hardware or
//! `vcan` interface is needed:
//!
//! ```bash
//! cargo test -p canary-tests
//! ```
//!
//! # Test Structure
//!
//! - `virtual_bus_test.rs` - loopback, latency, loss injection, shutdown bounds
//! - `manager_test.rs` - group lifecycle, partial failure, listener fan-out
//! - `scenario_test.rs` - scenario playback through a managed link

use std::sync::Arc;
use std::time::Duration;

use canary_core::{Frame, FrameCallback, LinkConfig, SimulationConfig};
use canary_manager::{CanManager, ReceivedFrame};
use parking_lot::Mutex;

/// Virtual bus link with the given latency and loss probability
pub fn virtual_link(channel: &str, latency: Duration, error_rate: f64) -> LinkConfig {
    LinkConfig::virtual_bus(channel).with_simulation(SimulationConfig::new(
        latency,
        Duration::from_millis(2),
        error_rate,
    ))
}

/// Callback that appends every delivered frame to a shared log
pub fn frame_log() -> (FrameCallback, Arc<Mutex<Vec<Frame>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callback: FrameCallback = Arc::new(move |frame: Frame| sink.lock().push(frame));
    (callback, log)
}

/// Register a listener on `manager` that records every received frame
pub fn listen(manager: &CanManager) -> Arc<Mutex<Vec<ReceivedFrame>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    manager.register_listener(move |received| sink.lock().push(received.clone()));
    log
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
