//! SocketCAN adapter for native CAN controllers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canary_core::{
    monotonic_now, BackendKind, CanLink, FilterRule, FilterSet, Frame, FrameCallback, LinkConfig,
    LinkError, LinkResult, LinkStatus, StopOutcome,
};
use parking_lot::Mutex;
use socketcan::{
    CanFilter, CanFrame, CanInterface, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id,
    Socket, SocketOptions, StandardId,
};
use tracing::{debug, info, trace, warn};

use crate::shared::LinkShared;
use crate::worker::{FrameSource, Worker, POLL_TIMEOUT};

/// Extended frame format flag in raw SocketCAN ids and masks
const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// IFF_UP in /sys/class/net/<if>/flags
const IFF_UP: u32 = 0x1;

/// CAN link on a native controller (`can0`, `vcan0`, ...)
pub struct HardwareLink {
    config: LinkConfig,
    shared: Arc<LinkShared>,
    socket: Mutex<Option<Arc<CanSocket>>>,
    worker: Mutex<Option<Worker>>,
}

impl HardwareLink {
    pub fn new(config: LinkConfig) -> Self {
        let shared = Arc::new(LinkShared::new(&config.channel, config.filters.clone()));
        Self {
            config,
            shared,
            socket: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn open_socket(&self) -> Result<Arc<CanSocket>, LinkError> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| LinkError::State(format!("link {} is not configured", self.name())))
    }
}

/// Bring the interface administratively up at the requested bitrate
///
/// Virtual interfaces (`vcan*`) have no bitrate and are only brought up
/// when they are not up already.
fn bring_up(channel: &str, bitrate: u32) -> Result<(), LinkError> {
    let iface = CanInterface::open(channel).map_err(|e| {
        LinkError::Configuration(format!("CAN interface {} not available: {}", channel, e))
    })?;

    if channel.starts_with("vcan") {
        if !interface_is_up(channel) {
            iface.bring_up().map_err(|e| {
                LinkError::Configuration(format!("Failed to bring up {}: {}", channel, e))
            })?;
        }
        return Ok(());
    }

    iface.bring_down().map_err(|e| {
        LinkError::Configuration(format!("Failed to bring down {}: {}", channel, e))
    })?;
    iface.set_bitrate(bitrate, None::<u32>).map_err(|e| {
        LinkError::Configuration(format!(
            "Failed to set bitrate {} on {}: {}",
            bitrate, channel, e
        ))
    })?;
    iface.bring_up().map_err(|e| {
        LinkError::Configuration(format!("Failed to bring up {}: {}", channel, e))
    })?;

    Ok(())
}

fn interface_is_up(channel: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{}/flags", channel))
        .ok()
        .and_then(|flags| u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).ok())
        .map(|flags| flags & IFF_UP != 0)
        .unwrap_or(false)
}

fn open_channel(channel: &str, bitrate: u32, filters: &FilterSet) -> Result<CanSocket, LinkError> {
    bring_up(channel, bitrate)?;

    let socket = CanSocket::open(channel).map_err(|e| {
        LinkError::Configuration(format!("Failed to open CAN socket on {}: {}", channel, e))
    })?;

    socket
        .set_read_timeout(POLL_TIMEOUT)
        .map_err(|e| LinkError::Configuration(format!("Failed to set read timeout: {}", e)))?;
    socket
        .set_write_timeout(POLL_TIMEOUT)
        .map_err(|e| LinkError::Configuration(format!("Failed to set write timeout: {}", e)))?;

    apply_kernel_filters(&socket, filters)?;
    Ok(socket)
}

fn apply_kernel_filters(socket: &CanSocket, filters: &FilterSet) -> Result<(), LinkError> {
    let result = if filters.is_empty() {
        socket.set_filter_accept_all()
    } else {
        let kernel: Vec<CanFilter> = filters.rules().iter().map(to_can_filter).collect();
        socket.set_filters(kernel.as_slice())
    };
    result.map_err(|e| LinkError::Configuration(format!("Filters rejected by kernel: {}", e)))
}

fn to_can_filter(rule: &FilterRule) -> CanFilter {
    let (id, mask) = raw_filter(rule);
    CanFilter::new(id, mask)
}

/// Raw (id, mask) pair as the kernel expects it
fn raw_filter(rule: &FilterRule) -> (u32, u32) {
    // The EFF bit is always part of the mask so standard rules never match extended frames
    let id = if rule.is_extended() {
        rule.id() | CAN_EFF_FLAG
    } else {
        rule.id()
    };
    (id, rule.mask() | CAN_EFF_FLAG)
}

fn to_can_frame(frame: &Frame) -> Result<CanFrame, LinkError> {
    let id = if frame.is_extended() {
        ExtendedId::new(frame.id()).map(Id::Extended)
    } else {
        StandardId::new(frame.id() as u16).map(Id::Standard)
    }
    .ok_or_else(|| LinkError::Transport(format!("Invalid CAN id 0x{:X}", frame.id())))?;

    CanFrame::new(id, frame.data())
        .ok_or_else(|| LinkError::Transport(format!("Cannot encode frame {}", frame)))
}

struct SocketSource {
    link: String,
    socket: Arc<CanSocket>,
}

impl FrameSource for SocketSource {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<Frame>, LinkError> {
        match self.socket.read_frame() {
            Ok(CanFrame::Data(frame)) => Frame::with_timestamp(
                frame.raw_id(),
                frame.data(),
                frame.is_extended(),
                monotonic_now(),
            )
            .map(Some)
            .map_err(|e| LinkError::Transport(e.to_string())),
            Ok(CanFrame::Remote(frame)) => {
                debug!(link = %self.link, raw_id = format!("0x{:X}", frame.raw_id()), "Ignoring remote frame");
                Ok(None)
            }
            Ok(CanFrame::Error(frame)) => {
                warn!(link = %self.link, ?frame, "Controller reported error frame");
                Ok(None)
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(LinkError::Transport(format!("SocketCAN read error: {}", e))),
        }
    }
}

#[async_trait]
impl CanLink for HardwareLink {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Hardware
    }

    fn status(&self) -> LinkStatus {
        self.shared.status()
    }

    fn set_callback(&self, callback: FrameCallback) {
        self.shared.set_callback(callback);
    }

    fn filters(&self) -> FilterSet {
        self.shared.filters()
    }

    async fn configure(&self) -> LinkResult<()> {
        self.shared.require_unconfigured()?;
        self.config.validate()?;

        let channel = self.config.channel.clone();
        let bitrate = self.config.bitrate;
        let filters = self.shared.filters();

        let socket = tokio::task::spawn_blocking(move || open_channel(&channel, bitrate, &filters))
            .await
            .map_err(|e| LinkError::Configuration(format!("Task join error: {}", e)))??;

        *self.socket.lock() = Some(Arc::new(socket));
        self.shared.set_status(LinkStatus::Configured);
        info!(link = %self.name(), bitrate, "SocketCAN link configured");
        Ok(())
    }

    async fn start(&self) -> LinkResult<()> {
        match self.shared.status() {
            LinkStatus::Unconfigured => Err(LinkError::State(format!(
                "link {} must be configured before start",
                self.name()
            ))),
            LinkStatus::Running => {
                warn!(link = %self.name(), "Link already running");
                Ok(())
            }
            LinkStatus::Configured => {
                let source = SocketSource {
                    link: self.name().to_string(),
                    socket: self.open_socket()?,
                };
                let worker = Worker::spawn_receive_loop(self.shared.clone(), source);
                *self.worker.lock() = Some(worker);
                self.shared.set_status(LinkStatus::Running);
                info!(link = %self.name(), "SocketCAN link started");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> LinkResult<StopOutcome> {
        let worker = self.worker.lock().take();
        let outcome = match worker {
            Some(worker) => worker.stop(self.config.grace_period()).await,
            None => StopOutcome::clean(Duration::ZERO),
        };

        // A forced worker still holds its clone until its current poll returns
        self.socket.lock().take();
        self.shared.set_status(LinkStatus::Unconfigured);
        info!(link = %self.name(), forced = outcome.forced, "SocketCAN link stopped");
        Ok(outcome)
    }

    async fn send(&self, frame: Frame) -> LinkResult<()> {
        self.shared.require_open()?;
        let socket = self.open_socket()?;
        let can_frame = to_can_frame(&frame)?;

        tokio::task::spawn_blocking(move || {
            socket
                .write_frame(&can_frame)
                .map_err(|e| LinkError::Transport(format!("SocketCAN write failed: {}", e)))
        })
        .await
        .map_err(|e| LinkError::Transport(format!("Task join error: {}", e)))??;

        trace!(link = %self.name(), %frame, "Frame sent");
        Ok(())
    }

    async fn set_filters(&self, rules: Vec<FilterRule>) -> LinkResult<()> {
        let socket = self.socket.lock().clone();
        self.shared
            .apply_filters(FilterSet::new(rules), |filters| match socket {
                Some(socket) => apply_kernel_filters(&socket, filters),
                None => Ok(()),
            })?;
        info!(link = %self.name(), rules = self.shared.filters().len(), "Filters replaced");
        Ok(())
    }
}

impl Drop for HardwareLink {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel();
        }
    }
}
