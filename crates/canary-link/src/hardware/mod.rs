//! Native controller adapter over SocketCAN (Linux only)

#[cfg(target_os = "linux")]
mod adapter;

#[cfg(target_os = "linux")]
pub use adapter::HardwareLink;
