//! canary-link - CAN link backends
//!
//! Implementations of [`canary_core::CanLink`]:
//! - [`HardwareLink`]: native controllers through SocketCAN (Linux only)
//! - [`BridgeLink`]: slcan USB-to-CAN bridges on a serial port
//! - [`VirtualBus`]: in-process loopback with latency and loss injection
//!
//! # Example
//!
//! ```ignore
//! use canary_core::LinkConfig;
//! use canary_link::factory;
//!
//! let link = factory::build_shared(LinkConfig::virtual_bus("vbus0"))?;
//! link.configure().await?;
//! link.start().await?;
//! ```

pub mod detect;
pub mod factory;
mod shared;
pub mod virtual_bus;
mod worker;

#[cfg(feature = "slcan")]
pub mod bridge;

#[cfg(feature = "socketcan")]
pub mod hardware;

pub use detect::PlatformInfo;
pub use factory::{build, build_shared};
pub use virtual_bus::{TrafficPattern, TrafficReport, VirtualBus, VirtualBusStats};
pub use worker::{ERROR_BACKOFF, POLL_TIMEOUT};

#[cfg(feature = "slcan")]
pub use bridge::BridgeLink;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use hardware::HardwareLink;
