//! Software-only loopback bus
//!
//! Frames accepted by `send` enter a bounded outbound queue. A forwarder
//! task holds each frame until `enqueued_at + send_latency`, applies the
//! injected error rate and moves survivors to a bounded inbound queue. A
//! delivery task wakes every `poll_interval`, drains the inbound queue and
//! hands each frame to recorders and then to the link callback.
//!
//! Frames still queued when `stop()` runs are discarded and counted; they
//! are never delivered after stop.

mod traffic;

pub use traffic::{TrafficEntry, TrafficPattern, TrafficReport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canary_core::{
    monotonic_now, BackendKind, CanLink, FilterRule, FilterSet, Frame, FrameCallback, LinkConfig,
    LinkError, LinkResult, LinkStatus, SimulationConfig, StopOutcome,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::shared::LinkShared;
use crate::worker::Worker;

/// Snapshot of virtual bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VirtualBusStats {
    /// Accepted by `send`
    pub sent: u64,
    /// Refused by `send` because the outbound queue was full
    pub rejected: u64,
    /// Handed to the callback
    pub delivered: u64,
    /// Lost to the injected error rate
    pub dropped_injected: u64,
    /// Still queued when the bus stopped
    pub discarded_on_stop: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    dropped_injected: AtomicU64,
    discarded_on_stop: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> VirtualBusStats {
        VirtualBusStats {
            sent: self.sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_injected: self.dropped_injected.load(Ordering::Relaxed),
            discarded_on_stop: self.discarded_on_stop.load(Ordering::Relaxed),
        }
    }
}

/// Sinks fed by the delivery task, used by `record`
#[derive(Default)]
struct Recorders {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, mpsc::UnboundedSender<Frame>)>>,
}

impl Recorders {
    fn add(&self) -> (u64, mpsc::UnboundedReceiver<Frame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().push((id, tx));
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.sinks.lock().retain(|(sink, _)| *sink != id);
    }

    fn offer(&self, frame: &Frame) {
        let sinks = self.sinks.lock();
        for (_, sink) in sinks.iter() {
            let _ = sink.send(*frame);
        }
    }
}

struct Pending {
    frame: Frame,
    due: Instant,
}

/// Queues allocated by `configure`; the receivers move into the workers on `start`
struct Queues {
    outbound_tx: mpsc::Sender<Pending>,
    outbound_rx: Option<mpsc::Receiver<Pending>>,
    inbound: Option<(mpsc::Sender<Frame>, mpsc::Receiver<Frame>)>,
}

/// Simulated CAN bus that loops every sent frame back to its own callback
pub struct VirtualBus {
    config: LinkConfig,
    shared: Arc<LinkShared>,
    counters: Arc<Counters>,
    recorders: Arc<Recorders>,
    queues: Mutex<Option<Queues>>,
    worker: Mutex<Option<Worker>>,
}

impl VirtualBus {
    pub fn new(config: LinkConfig) -> Self {
        let shared = Arc::new(LinkShared::new(&config.channel, config.filters.clone()));
        Self {
            config,
            shared,
            counters: Arc::new(Counters::default()),
            recorders: Arc::new(Recorders::default()),
            queues: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn simulation(&self) -> &SimulationConfig {
        &self.config.simulation
    }

    pub fn stats(&self) -> VirtualBusStats {
        self.counters.snapshot()
    }

    /// Replay `pattern` through `send`
    ///
    /// Rejected frames are counted, not retried.
    pub async fn generate_traffic(&self, pattern: &TrafficPattern) -> LinkResult<TrafficReport> {
        if self.shared.status() != LinkStatus::Running {
            return Err(LinkError::State(format!(
                "virtual bus {} is not running",
                self.name()
            )));
        }

        info!(
            link = %self.name(),
            pattern = %pattern.name,
            frames = pattern.frame_count(),
            "Generating traffic"
        );

        let mut report = TrafficReport::default();
        for _ in 0..pattern.cycles {
            for entry in &pattern.entries {
                for _ in 0..entry.repeat_count {
                    report.attempted += 1;
                    match self.send(entry.frame.stamp()).await {
                        Ok(()) => report.accepted += 1,
                        Err(e) => {
                            debug!(link = %self.name(), error = %e, "Traffic frame rejected");
                            report.rejected += 1;
                        }
                    }
                    let interval = entry.interval();
                    if !interval.is_zero() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }

        debug!(link = %self.name(), ?report, "Traffic generation finished");
        Ok(report)
    }

    /// Collect every frame delivered on the bus during `duration`
    ///
    /// Recording sees bus traffic before the link's filters are applied.
    /// Several recordings may run at once.
    pub async fn record(&self, duration: Duration) -> Vec<Frame> {
        let (id, mut rx) = self.recorders.add();
        tokio::time::sleep(duration).await;
        self.recorders.remove(id);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        debug!(link = %self.name(), frames = frames.len(), "Recording finished");
        frames
    }
}

#[async_trait]
impl CanLink for VirtualBus {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Virtual
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
        let sim = &self.config.simulation;
        sim.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::channel(sim.queue_capacity);
        let inbound = mpsc::channel(sim.queue_capacity);
        *self.queues.lock() = Some(Queues {
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound: Some(inbound),
        });

        self.shared.set_status(LinkStatus::Configured);
        info!(
            link = %self.name(),
            latency_ms = sim.send_latency_ms,
            poll_interval_ms = sim.poll_interval_ms,
            error_rate = sim.error_rate,
            queue_capacity = sim.queue_capacity,
            "Virtual bus configured"
        );
        Ok(())
    }

    async fn start(&self) -> LinkResult<()> {
        match self.shared.status() {
            LinkStatus::Unconfigured => {
                return Err(LinkError::State(format!(
                    "virtual bus {} must be configured before start",
                    self.name()
                )))
            }
            LinkStatus::Running => {
                warn!(link = %self.name(), "Virtual bus already running");
                return Ok(());
            }
            LinkStatus::Configured => {}
        }

        let (outbound_rx, (inbound_tx, inbound_rx)) = {
            let mut queues = self.queues.lock();
            let queues = queues.as_mut().ok_or_else(|| {
                LinkError::State(format!("virtual bus {} has no queues", self.name()))
            })?;
            match (queues.outbound_rx.take(), queues.inbound.take()) {
                (Some(outbound), Some(inbound)) => (outbound, inbound),
                _ => {
                    return Err(LinkError::State(format!(
                        "virtual bus {} queues already in use",
                        self.name()
                    )))
                }
            }
        };

        let sim = &self.config.simulation;
        let rng = match sim.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let token = CancellationToken::new();

        let forwarder = tokio::spawn(forward(
            self.name().to_string(),
            outbound_rx,
            inbound_tx,
            sim.error_rate,
            rng,
            self.counters.clone(),
            token.clone(),
        ));
        let delivery = tokio::spawn(deliver(
            inbound_rx,
            self.shared.clone(),
            self.recorders.clone(),
            self.counters.clone(),
            sim.poll_interval(),
            token.clone(),
        ));

        *self.worker.lock() = Some(Worker::new(self.name(), token, vec![forwarder, delivery]));
        self.shared.set_status(LinkStatus::Running);
        info!(link = %self.name(), "Virtual bus started");
        Ok(())
    }

    async fn stop(&self) -> LinkResult<StopOutcome> {
        let worker = self.worker.lock().take();
        let before = self.counters.discarded_on_stop.load(Ordering::Relaxed);
        let outcome = match worker {
            Some(worker) => worker.stop(self.config.grace_period()).await,
            None => StopOutcome::clean(Duration::ZERO),
        };

        // Frames that never reached the workers die with the queues
        let queues = self.queues.lock().take();
        if let Some(queues) = queues {
            let mut leftover = 0;
            if let Some(mut rx) = queues.outbound_rx {
                while rx.try_recv().is_ok() {
                    leftover += 1;
                }
            }
            if let Some((_, mut rx)) = queues.inbound {
                while rx.try_recv().is_ok() {
                    leftover += 1;
                }
            }
            Counters::bump(&self.counters.discarded_on_stop, leftover);
        }

        self.shared.set_status(LinkStatus::Unconfigured);
        let discarded = self
            .counters
            .discarded_on_stop
            .load(Ordering::Relaxed)
            .saturating_sub(before);
        if discarded > 0 {
            warn!(link = %self.name(), discarded, "Discarded queued frames on stop");
        }
        info!(link = %self.name(), forced = outcome.forced, "Virtual bus stopped");
        Ok(outcome)
    }

    async fn send(&self, frame: Frame) -> LinkResult<()> {
        if self.shared.status() != LinkStatus::Running {
            return Err(LinkError::State(format!(
                "virtual bus {} is not running",
                self.name()
            )));
        }

        let tx = self
            .queues
            .lock()
            .as_ref()
            .map(|queues| queues.outbound_tx.clone())
            .ok_or_else(|| {
                LinkError::State(format!("virtual bus {} is not running", self.name()))
            })?;

        let pending = Pending {
            frame,
            due: Instant::now() + self.config.simulation.send_latency(),
        };
        match tx.try_send(pending) {
            Ok(()) => {
                Counters::bump(&self.counters.sent, 1);
                trace!(link = %self.name(), %frame, "Frame queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Counters::bump(&self.counters.rejected, 1);
                Err(LinkError::Transport(format!(
                    "virtual bus {} outbound queue full ({} frames)",
                    self.name(),
                    self.config.simulation.queue_capacity
                )))
            }
            Err(TrySendError::Closed(_)) => Err(LinkError::State(format!(
                "virtual bus {} is stopping",
                self.name()
            ))),
        }
    }

    async fn set_filters(&self, rules: Vec<FilterRule>) -> LinkResult<()> {
        self.shared.replace_filters(FilterSet::new(rules));
        info!(link = %self.name(), rules = self.shared.filters().len(), "Filters replaced");
        Ok(())
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel();
        }
    }
}

/// Outbound -> inbound, honouring latency and the injected error rate
async fn forward(
    link: String,
    mut outbound: mpsc::Receiver<Pending>,
    inbound: mpsc::Sender<Frame>,
    error_rate: f64,
    mut rng: StdRng,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    let mut discarded = 0u64;
    loop {
        let pending = tokio::select! {
            _ = token.cancelled() => break,
            pending = outbound.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };

        tokio::select! {
            _ = token.cancelled() => {
                discarded += 1;
                break;
            }
            _ = tokio::time::sleep_until(pending.due) => {}
        }

        if error_rate > 0.0 && rng.gen_bool(error_rate) {
            Counters::bump(&counters.dropped_injected, 1);
            debug!(link = %link, frame = %pending.frame, "Injected frame loss");
            continue;
        }

        let frame = pending.frame.restamped(monotonic_now());
        tokio::select! {
            _ = token.cancelled() => {
                discarded += 1;
                break;
            }
            sent = inbound.send(frame) => {
                if sent.is_err() {
                    discarded += 1;
                    break;
                }
            }
        }
    }

    outbound.close();
    while outbound.try_recv().is_ok() {
        discarded += 1;
    }
    Counters::bump(&counters.discarded_on_stop, discarded);
    trace!(link = %link, discarded, "Forwarder stopped");
}

/// Drain the inbound queue every poll interval
async fn deliver(
    mut inbound: mpsc::Receiver<Frame>,
    shared: Arc<LinkShared>,
    recorders: Arc<Recorders>,
    counters: Arc<Counters>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        while let Ok(frame) = inbound.try_recv() {
            if token.is_cancelled() {
                Counters::bump(&counters.discarded_on_stop, 1);
                break 'outer;
            }
            recorders.offer(&frame);
            Counters::bump(&counters.delivered, 1);
            shared.dispatch(frame);
        }
    }

    inbound.close();
    let mut discarded = 0u64;
    while inbound.try_recv().is_ok() {
        discarded += 1;
    }
    Counters::bump(&counters.discarded_on_stop, discarded);
    trace!(link = %shared.name(), discarded, "Delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn bus(sim: SimulationConfig) -> VirtualBus {
        VirtualBus::new(LinkConfig::virtual_bus("vbus0").with_simulation(sim))
    }

    fn collect(bus: &VirtualBus) -> Arc<Mutex<Vec<Frame>>> {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        bus.set_callback(Arc::new(move |frame: Frame| sink.lock().push(frame)));
        frames
    }

    async fn running(sim: SimulationConfig) -> VirtualBus {
        let bus = bus(sim);
        bus.configure().await.unwrap();
        bus.start().await.unwrap();
        bus
    }

    async fn wait_for(frames: &Arc<Mutex<Vec<Frame>>>, count: usize, limit: Duration) {
        let deadline = Instant::now() + limit;
        while frames.lock().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_loopback_preserves_order() {
        let bus = running(SimulationConfig::default()).await;
        let frames = collect(&bus);

        for i in 0..20u8 {
            bus.send(Frame::standard(0x100 + i as u32, &[i]).unwrap())
                .await
                .unwrap();
        }
        wait_for(&frames, 20, Duration::from_secs(1)).await;
        bus.stop().await.unwrap();

        let ids: Vec<u32> = frames.lock().iter().map(|f| f.id()).collect();
        assert_eq!(ids, (0x100..0x114).collect::<Vec<u32>>());
        assert_eq!(bus.stats().delivered, 20);
        assert_eq!(bus.stats().sent, 20);
    }

    #[tokio::test]
    async fn test_delivery_restamps_after_latency() {
        let sim = SimulationConfig::new(Duration::from_millis(30), Duration::from_millis(1), 0.0);
        let bus = running(sim).await;
        let frames = collect(&bus);

        let frame = Frame::standard(0x123, &[0xDE, 0xAD]).unwrap();
        bus.send(frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(frames.lock().is_empty());

        wait_for(&frames, 1, Duration::from_secs(1)).await;
        bus.stop().await.unwrap();

        let received = frames.lock()[0];
        assert_eq!(received.template(), frame.template());
        assert!(received.timestamp() - frame.timestamp() >= 0.029);
    }

    #[tokio::test]
    async fn test_send_requires_running() {
        let bus = bus(SimulationConfig::default());
        let frame = Frame::standard(0x1, &[]).unwrap();
        assert!(matches!(bus.send(frame).await, Err(LinkError::State(_))));

        bus.configure().await.unwrap();
        assert!(matches!(bus.send(frame).await, Err(LinkError::State(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let bus = bus(SimulationConfig::default());
        assert!(matches!(bus.start().await, Err(LinkError::State(_))));

        bus.configure().await.unwrap();
        assert!(matches!(bus.configure().await, Err(LinkError::State(_))));

        bus.start().await.unwrap();
        // second start is a no-op
        bus.start().await.unwrap();
        assert_eq!(bus.status(), LinkStatus::Running);

        let outcome = bus.stop().await.unwrap();
        assert!(!outcome.forced);
        assert_eq!(bus.status(), LinkStatus::Unconfigured);

        // the bus can be brought up again
        bus.configure().await.unwrap();
        bus.start().await.unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_error_rate_rejected() {
        let bus = bus(SimulationConfig::new(Duration::ZERO, Duration::from_millis(5), 1.5));
        assert!(matches!(
            bus.configure().await,
            Err(LinkError::Configuration(_))
        ));
        assert_eq!(bus.status(), LinkStatus::Unconfigured);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_with_transport_error() {
        let sim = SimulationConfig::new(Duration::from_secs(10), Duration::from_millis(5), 0.0)
            .with_queue_capacity(2);
        let bus = running(sim).await;
        let frame = Frame::standard(0x10, &[]).unwrap();

        // the forwarder holds one frame while it waits out the latency
        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(bus.send(frame).await);
            tokio::task::yield_now().await;
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LinkError::Transport(_)))));
        assert!(bus.stats().rejected > 0);

        bus.stop().await.unwrap();
        let stats = bus.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.discarded_on_stop, stats.sent);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_frames() {
        let sim = SimulationConfig::new(Duration::from_millis(500), Duration::from_millis(5), 0.0);
        let bus = running(sim).await;
        let frames = collect(&bus);

        for i in 0..5u8 {
            bus.send(Frame::standard(0x200, &[i]).unwrap()).await.unwrap();
        }
        bus.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(frames.lock().is_empty());
        assert_eq!(bus.stats().discarded_on_stop, 5);
    }

    #[tokio::test]
    async fn test_full_error_rate_drops_everything() {
        let sim = SimulationConfig::new(Duration::ZERO, Duration::from_millis(1), 1.0).with_seed(7);
        let bus = running(sim).await;
        let frames = collect(&bus);

        for _ in 0..10 {
            bus.send(Frame::standard(0x300, &[]).unwrap()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop().await.unwrap();

        assert!(frames.lock().is_empty());
        assert_eq!(bus.stats().dropped_injected, 10);
    }

    #[tokio::test]
    async fn test_filters_limit_callback_not_recording() {
        let bus = VirtualBus::new(
            LinkConfig::virtual_bus("vbus0")
                .with_filters(vec![FilterRule::exact(0x7E8, false).unwrap()]),
        );
        bus.configure().await.unwrap();
        bus.start().await.unwrap();
        let frames = collect(&bus);

        let recording = bus.record(Duration::from_millis(100));
        let sending = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bus.send(Frame::standard(0x7E0, &[0x02]).unwrap()).await.unwrap();
            bus.send(Frame::standard(0x7E8, &[0x06]).unwrap()).await.unwrap();
        };
        let (recorded, ()) = tokio::join!(recording, sending);
        bus.stop().await.unwrap();

        assert_eq!(recorded.len(), 2);
        let ids: Vec<u32> = frames.lock().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![0x7E8]);
    }

    #[tokio::test]
    async fn test_generate_traffic() {
        let bus = running(SimulationConfig::default()).await;
        let frames = collect(&bus);

        let pattern = TrafficPattern::burst(0x400, 8).unwrap();
        let report = bus.generate_traffic(&pattern).await.unwrap();
        assert_eq!(
            report,
            TrafficReport {
                attempted: 8,
                accepted: 8,
                rejected: 0
            }
        );

        wait_for(&frames, 8, Duration::from_secs(1)).await;
        bus.stop().await.unwrap();
        assert_eq!(frames.lock().len(), 8);

        assert!(matches!(
            bus.generate_traffic(&pattern).await,
            Err(LinkError::State(_))
        ));
    }
}
