//! Bridge adapter for slcan USB-to-CAN dongles

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use canary_core::{
    BackendKind, CanLink, FilterRule, FilterSet, Frame, FrameCallback, LinkConfig, LinkError,
    LinkResult, LinkStatus, StopOutcome,
};
use parking_lot::Mutex;
use serialport::SerialPort;
use tracing::{debug, info, trace, warn};

use super::codec::{bitrate_command, LineBuffer, SlcanCodec, SlcanMessage};
use crate::shared::LinkShared;
use crate::worker::{FrameSource, Worker, POLL_TIMEOUT};

/// How long the adapter gets to acknowledge a setup command
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

const CLOSE: &[u8] = b"C\r";
const OPEN: &[u8] = b"O\r";

type Port = Box<dyn SerialPort>;

/// CAN link through an slcan serial bridge (`/dev/ttyACM0`, `COM3`, ...)
pub struct BridgeLink {
    config: LinkConfig,
    shared: Arc<LinkShared>,
    port: Arc<Mutex<Option<Port>>>,
    worker: Mutex<Option<Worker>>,
}

impl BridgeLink {
    pub fn new(config: LinkConfig) -> Self {
        let shared = Arc::new(LinkShared::new(&config.channel, config.filters.clone()));
        Self {
            config,
            shared,
            port: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    fn clone_reader(&self) -> LinkResult<Port> {
        let guard = self.port.lock();
        let port = guard
            .as_ref()
            .ok_or_else(|| LinkError::State(format!("link {} is not configured", self.name())))?;
        port.try_clone()
            .map_err(|e| LinkError::Transport(format!("Failed to clone serial port: {}", e)))
    }
}

fn open_port(channel: &str, baud: u32, speed: &[u8]) -> LinkResult<Port> {
    let mut port = serialport::new(channel, baud)
        .timeout(POLL_TIMEOUT)
        .open()
        .map_err(|e| {
            LinkError::Configuration(format!("Failed to open serial port {}: {}", channel, e))
        })?;

    // Adapters that are already closed answer C with BEL
    if let Err(e) = command(&mut port, CLOSE, COMMAND_TIMEOUT) {
        debug!(channel, error = %e, "Close before setup not acknowledged");
    }
    command(&mut port, speed, COMMAND_TIMEOUT)?;
    command(&mut port, OPEN, COMMAND_TIMEOUT)?;

    Ok(port)
}

/// Write one setup command and wait for its acknowledgement
fn command<P: Read + Write>(port: &mut P, cmd: &[u8], timeout: Duration) -> LinkResult<()> {
    let name = String::from_utf8_lossy(cmd).trim_end().to_string();
    port.write_all(cmd)
        .and_then(|_| port.flush())
        .map_err(|e| LinkError::Configuration(format!("Failed to write {}: {}", name, e)))?;

    let deadline = Instant::now() + timeout;
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 64];
    loop {
        while let Some(message) = lines.next_message() {
            match message {
                Ok(SlcanMessage::Ack) => return Ok(()),
                Ok(SlcanMessage::Bell) => {
                    return Err(LinkError::Configuration(format!(
                        "adapter rejected command {}",
                        name
                    )))
                }
                // Bus traffic interleaved with the reply
                Ok(_) | Err(_) => {}
            }
        }

        if Instant::now() >= deadline {
            return Err(LinkError::Configuration(format!(
                "no reply to command {} within {:?}",
                name, timeout
            )));
        }

        match port.read(&mut chunk) {
            Ok(0) => std::thread::sleep(Duration::from_millis(5)),
            Ok(n) => lines.extend(&chunk[..n]),
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                return Err(LinkError::Configuration(format!(
                    "Failed to read reply to {}: {}",
                    name, e
                )))
            }
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

/// Receive side of the bridge; owns a cloned handle of the port
struct SerialSource<R> {
    link: String,
    reader: R,
    lines: LineBuffer,
}

impl<R: Read + Send + 'static> FrameSource for SerialSource<R> {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<Frame>, LinkError> {
        let mut chunk = [0u8; 64];
        loop {
            while let Some(message) = self.lines.next_message() {
                match message? {
                    SlcanMessage::Data(frame) => return Ok(Some(frame)),
                    SlcanMessage::Remote { id, .. } => {
                        debug!(link = %self.link, id = format!("0x{:X}", id), "Ignoring remote frame");
                    }
                    SlcanMessage::Ack => {}
                    SlcanMessage::Bell => {
                        return Err(LinkError::Transport(
                            "adapter signalled an error (BEL)".to_string(),
                        ))
                    }
                }
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.lines.extend(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(LinkError::Transport(format!("Serial read error: {}", e))),
            }
        }
    }
}

#[async_trait]
impl CanLink for BridgeLink {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Bridge
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
        let speed = bitrate_command(self.config.bitrate)?;

        let channel = self.config.channel.clone();
        let baud = self.config.serial_baud;
        let port = tokio::task::spawn_blocking(move || open_port(&channel, baud, speed))
            .await
            .map_err(|e| LinkError::Configuration(format!("Task join error: {}", e)))??;

        *self.port.lock() = Some(port);
        self.shared.set_status(LinkStatus::Configured);
        info!(
            link = %self.name(),
            bitrate = self.config.bitrate,
            baud = self.config.serial_baud,
            "slcan link configured"
        );
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
                let source = SerialSource {
                    link: self.name().to_string(),
                    reader: self.clone_reader()?,
                    lines: LineBuffer::new(),
                };
                let worker = Worker::spawn_receive_loop(self.shared.clone(), source);
                *self.worker.lock() = Some(worker);
                self.shared.set_status(LinkStatus::Running);
                info!(link = %self.name(), "slcan link started");
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

        let port = self.port.lock().take();
        if let Some(mut port) = port {
            let link = self.name().to_string();
            // Best effort: the adapter may already be gone
            let closed = tokio::task::spawn_blocking(move || {
                if let Err(e) = port.write_all(CLOSE).and_then(|_| port.flush()) {
                    debug!(link = %link, error = %e, "Failed to close slcan channel");
                }
            });
            let _ = tokio::time::timeout(POLL_TIMEOUT, closed).await;
        }

        self.shared.set_status(LinkStatus::Unconfigured);
        info!(link = %self.name(), forced = outcome.forced, "slcan link stopped");
        Ok(outcome)
    }

    async fn send(&self, frame: Frame) -> LinkResult<()> {
        self.shared.require_open()?;
        let line = SlcanCodec::encode(&frame);
        let port = self.port.clone();
        let link = self.name().to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock();
            let port = guard
                .as_mut()
                .ok_or_else(|| LinkError::State(format!("link {} is not configured", link)))?;
            port.write_all(&line)
                .and_then(|_| port.flush())
                .map_err(|e| LinkError::Transport(format!("Serial write failed: {}", e)))
        })
        .await
        .map_err(|e| LinkError::Transport(format!("Task join error: {}", e)))??;

        trace!(link = %self.name(), %frame, "Frame sent");
        Ok(())
    }

    async fn set_filters(&self, rules: Vec<FilterRule>) -> LinkResult<()> {
        if self.shared.status() == LinkStatus::Running {
            return Err(LinkError::State(format!(
                "link {}: slcan filters can only change while the channel is not running",
                self.name()
            )));
        }
        self.shared.replace_filters(FilterSet::new(rules));
        info!(link = %self.name(), rules = self.shared.filters().len(), "Filters replaced");
        Ok(())
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    use pretty_assertions::assert_eq;

    /// Serial stand-in: records writes, replays scripted reads
    #[derive(Default)]
    struct FakePort {
        written: Vec<u8>,
        replies: VecDeque<io::Result<Vec<u8>>>,
    }

    impl FakePort {
        fn replying(replies: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                written: Vec::new(),
                replies: replies.into(),
            }
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
            }
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_command_acknowledged() {
        let mut port = FakePort::replying(vec![Ok(b"\r".to_vec())]);
        command(&mut port, b"S6\r", Duration::from_millis(50)).unwrap();
        assert_eq!(port.written, b"S6\r".to_vec());
    }

    #[test]
    fn test_command_skips_interleaved_traffic() {
        let mut port = FakePort::replying(vec![
            Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
            Ok(b"t1001AA\r".to_vec()),
            Ok(b"\r".to_vec()),
        ]);
        assert!(command(&mut port, OPEN, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_command_rejected_with_bell() {
        let mut port = FakePort::replying(vec![Ok(vec![0x07])]);
        let err = command(&mut port, b"S6\r", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn test_command_times_out() {
        let mut port = FakePort::default();
        let err = command(&mut port, OPEN, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn test_serial_source_yields_frames() {
        let reader = FakePort::replying(vec![
            Ok(b"z\rt1232DE".to_vec()),
            Ok(b"AD\rr1000\r".to_vec()),
        ]);
        let mut source = SerialSource {
            link: "test".to_string(),
            reader,
            lines: LineBuffer::new(),
        };

        let frame = source.poll(POLL_TIMEOUT).unwrap().unwrap();
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.data(), &[0xDE, 0xAD]);
        // remote frame skipped, then the scripted reads run out
        assert_eq!(source.poll(POLL_TIMEOUT).unwrap(), None);
    }

    #[test]
    fn test_serial_source_reports_garbage() {
        let reader = FakePort::replying(vec![Ok(b"q!\r".to_vec())]);
        let mut source = SerialSource {
            link: "test".to_string(),
            reader,
            lines: LineBuffer::new(),
        };
        assert!(matches!(
            source.poll(POLL_TIMEOUT),
            Err(LinkError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_bitrate_fails_before_opening() {
        let link = BridgeLink::new(LinkConfig::new(
            "/dev/does-not-exist",
            333_333,
            BackendKind::Bridge,
        ));
        let err = link.configure().await.unwrap_err();
        assert!(err.to_string().contains("333333"));
        assert_eq!(link.status(), LinkStatus::Unconfigured);
    }

    #[tokio::test]
    async fn test_missing_port_fails_configuration() {
        let link = BridgeLink::new(LinkConfig::new(
            "/dev/does-not-exist",
            500_000,
            BackendKind::Bridge,
        ));
        assert!(matches!(
            link.configure().await,
            Err(LinkError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_filters_and_send_while_unconfigured() {
        let link = BridgeLink::new(LinkConfig::new("/dev/ttyACM0", 500_000, BackendKind::Bridge));
        link.set_filters(vec![FilterRule::exact(0x7E8, false).unwrap()])
            .await
            .unwrap();
        assert_eq!(link.filters().len(), 1);

        let err = link
            .send(Frame::standard(0x7E0, &[0x02, 0x10, 0x01]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::State(_)));
    }

    #[tokio::test]
    async fn test_filters_locked_while_running() {
        let link = BridgeLink::new(LinkConfig::new("/dev/ttyACM0", 500_000, BackendKind::Bridge));
        link.set_filters(vec![FilterRule::exact(0x7E8, false).unwrap()])
            .await
            .unwrap();
        let before = link.filters();

        link.shared.set_status(LinkStatus::Running);
        let err = link
            .set_filters(vec![FilterRule::new(0x700, 0x700, false).unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::State(_)));
        assert_eq!(link.filters(), before);

        link.shared.set_status(LinkStatus::Configured);
        link.set_filters(Vec::new()).await.unwrap();
        assert!(link.filters().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_clean() {
        let link = BridgeLink::new(LinkConfig::new("/dev/ttyACM0", 500_000, BackendKind::Bridge));
        let outcome = link.stop().await.unwrap();
        assert!(!outcome.forced);
    }
}
