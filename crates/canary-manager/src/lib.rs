//! canary-manager - Ownership and coordination of CAN links
//!
//! [`CanManager`] owns a set of named links, starts and stops them as a
//! group with per-link results, provides a single send surface and fans
//! every received frame out to all registered listeners.

pub mod error;
pub mod handle;
pub mod listener;
pub mod manager;

pub use error::{ManagerError, ManagerResult};
pub use handle::{LinkHandle, LinkState, PerLinkResult};
pub use listener::{Listener, ListenerId, ReceivedFrame};
pub use manager::{CanManager, DEFAULT_EVENT_CAPACITY};
