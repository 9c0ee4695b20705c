//! canary-core - Core traits and types for the canary CAN bus simulator
//!
//! This crate provides the value types shared by every layer (frames,
//! filter rules, link configuration) and the [`CanLink`] trait that all
//! backends implement.

pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod link;

pub use config::{BackendKind, LinkConfig, SimulationConfig};
pub use error::{ErrorCategory, FrameError, LinkError, LinkResult};
pub use filter::{FilterRule, FilterSet};
pub use frame::{
    monotonic_now, parse_can_id, Frame, FrameTemplate, MAX_DATA_LEN, MAX_EXTENDED_ID,
    MAX_STANDARD_ID,
};
pub use link::{CanLink, FrameCallback, LinkStatus, StopOutcome};
