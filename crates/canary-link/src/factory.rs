//! Build a link from its configuration

use std::sync::Arc;

use canary_core::{BackendKind, CanLink, LinkConfig, LinkError};
use tracing::debug;

use crate::virtual_bus::VirtualBus;

/// Construct the backend named by `config.backend_kind`
///
/// The link is returned unconfigured. Backends not compiled for this
/// target yield `UnsupportedBackend`.
pub fn build(config: LinkConfig) -> Result<Box<dyn CanLink>, LinkError> {
    debug!(channel = %config.channel, kind = %config.backend_kind, "Building link");
    match config.backend_kind {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        BackendKind::Hardware => Ok(Box::new(crate::hardware::HardwareLink::new(config))),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        BackendKind::Hardware => Err(LinkError::UnsupportedBackend(
            "hardware links require Linux and the 'socketcan' feature".to_string(),
        )),
        #[cfg(feature = "slcan")]
        BackendKind::Bridge => Ok(Box::new(crate::bridge::BridgeLink::new(config))),
        #[cfg(not(feature = "slcan"))]
        BackendKind::Bridge => Err(LinkError::UnsupportedBackend(
            "bridge links require the 'slcan' feature".to_string(),
        )),
        BackendKind::Virtual => Ok(Box::new(VirtualBus::new(config))),
    }
}

/// [`build`], shared
pub fn build_shared(config: LinkConfig) -> Result<Arc<dyn CanLink>, LinkError> {
    build(config).map(Arc::from)
}
