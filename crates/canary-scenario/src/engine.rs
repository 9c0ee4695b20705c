//! Tick-driven scenario engine
//!
//! ```text
//! Idle --load--> Ready --start--> Running <--pause/resume--> Paused
//!                                    |                          |
//!                                    +--stop / last frame--> Completed
//! Ready | Running | Paused --failure--> Error
//! Completed | Error --reset--> Idle
//! ```
//!
//! Each tick sends every frame that is due through the manager. The cursor
//! is advanced only after a send returns, and a frame in flight blocks the
//! next one, so pausing never skips or repeats a frame.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use canary_manager::CanManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::{ScenarioError, ScenarioResult};
use crate::model::Scenario;
use crate::repository::ScenarioRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Ready,
    Running,
    Paused,
    Completed,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick cadence (milliseconds)
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

fn default_tick() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
        }
    }
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Where the engine is within the loaded scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioProgress {
    pub step_index: usize,
    pub sent_in_step: u32,
    pub frames_sent: u64,
    pub total_frames: u64,
}

enum Next {
    Send { link: String, frame: canary_core::Frame },
    Wait,
    Finished,
}

#[derive(Default)]
struct Cursor {
    step_index: usize,
    sent_in_step: u32,
    frames_sent: u64,
    next_due: Option<Instant>,
    paused_remaining: Option<Duration>,
    in_flight: bool,
}

struct Inner {
    state: EngineState,
    states: watch::Sender<EngineState>,
    scenario: Option<Scenario>,
    cursor: Cursor,
    last_error: Option<ScenarioError>,
    token: Option<CancellationToken>,
    /// Bumped whenever the cursor is replaced; tick loops of older runs stand down
    run: u64,
}

impl Inner {
    fn transition(&mut self, to: EngineState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "Scenario engine transition");
        }
        self.state = to;
        self.states.send_replace(to);
    }

    fn cancel_ticks(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    fn new_run(&mut self) {
        self.cancel_ticks();
        self.cursor = Cursor::default();
        self.run = self.run.wrapping_add(1);
    }

    fn state_error(&self, operation: &str) -> ScenarioError {
        ScenarioError::State(format!("cannot {} while {}", operation, self.state))
    }

    /// Next frame if due; marks it in flight
    fn peek(&mut self, now: Instant) -> Next {
        let Some(scenario) = self.scenario.as_ref() else {
            return Next::Finished;
        };
        if self.cursor.in_flight {
            return Next::Wait;
        }

        while let Some(step) = scenario.steps.get(self.cursor.step_index) {
            if self.cursor.sent_in_step < step.repeat_count {
                break;
            }
            self.cursor.step_index += 1;
            self.cursor.sent_in_step = 0;
        }
        let Some(step) = scenario.steps.get(self.cursor.step_index) else {
            return Next::Finished;
        };

        if self.cursor.next_due.is_some_and(|due| now < due) {
            return Next::Wait;
        }

        self.cursor.in_flight = true;
        Next::Send {
            link: scenario.link.clone(),
            frame: step.frame.stamp(),
        }
    }

    /// Advance past the frame that was just sent
    fn commit(&mut self, now: Instant) {
        let Some(scenario) = self.scenario.as_ref() else {
            return;
        };
        let Some(step) = scenario.steps.get(self.cursor.step_index) else {
            return;
        };
        let delay = step.inter_frame_delay();

        self.cursor.in_flight = false;
        self.cursor.frames_sent += 1;
        self.cursor.sent_in_step += 1;
        if self.cursor.sent_in_step >= step.repeat_count {
            self.cursor.step_index += 1;
            self.cursor.sent_in_step = 0;
        }

        if self.state == EngineState::Paused {
            self.cursor.paused_remaining = Some(delay);
        } else {
            self.cursor.next_due = Some(now + delay);
        }
    }

    fn progress(&self) -> ScenarioProgress {
        ScenarioProgress {
            step_index: self.cursor.step_index,
            sent_in_step: self.cursor.sent_in_step,
            frames_sent: self.cursor.frames_sent,
            total_frames: self
                .scenario
                .as_ref()
                .map(Scenario::total_frames)
                .unwrap_or(0),
        }
    }
}

/// Drives one scenario at a time through a [`CanManager`]
pub struct ScenarioEngine {
    manager: Arc<CanManager>,
    config: EngineConfig,
    inner: Arc<Mutex<Inner>>,
}

impl ScenarioEngine {
    pub fn new(manager: Arc<CanManager>, config: EngineConfig) -> Self {
        let (states, _) = watch::channel(EngineState::Idle);
        Self {
            manager,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: EngineState::Idle,
                states,
                scenario: None,
                cursor: Cursor::default(),
                last_error: None,
                token: None,
                run: 0,
            })),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Observe state changes, including the automatic move to `Completed`
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.lock().states.subscribe()
    }

    pub fn progress(&self) -> ScenarioProgress {
        self.inner.lock().progress()
    }

    /// Cause of the last transition to `Error`
    pub fn last_error(&self) -> Option<ScenarioError> {
        self.inner.lock().last_error.clone()
    }

    pub fn scenario_name(&self) -> Option<String> {
        self.inner.lock().scenario.as_ref().map(|s| s.name.clone())
    }

    /// Idle -> Ready
    pub fn load(&self, scenario: Scenario) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Idle {
            return Err(inner.state_error("load"));
        }
        scenario.validate()?;

        info!(
            scenario = %scenario.name,
            link = %scenario.link,
            steps = scenario.steps.len(),
            frames = scenario.total_frames(),
            "Scenario loaded"
        );
        inner.new_run();
        inner.scenario = Some(scenario);
        inner.last_error = None;
        inner.transition(EngineState::Ready);
        Ok(())
    }

    /// Fetch `name` from `repository` and load it
    pub async fn load_from(
        &self,
        repository: &dyn ScenarioRepository,
        name: &str,
    ) -> ScenarioResult<()> {
        if self.state() != EngineState::Idle {
            return Err(self.inner.lock().state_error("load"));
        }
        let scenario = repository.get(name).await?;
        self.load(scenario)
    }

    /// Ready -> Running
    pub fn start(&self) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Ready {
            return Err(inner.state_error("start"));
        }
        let target = inner.scenario.as_ref().map(|s| s.link.clone()).unwrap_or_default();
        if self.manager.link(&target).is_none() {
            let err = ScenarioError::Send(
                canary_manager::ManagerError::UnknownLink(target.clone()).to_string(),
            );
            error!(link = %target, "Scenario targets an unmanaged link");
            inner.last_error = Some(err.clone());
            inner.transition(EngineState::Error);
            return Err(err);
        }
        inner.cursor.next_due = None;
        inner.transition(EngineState::Running);
        self.spawn_ticks(&mut inner);
        info!(scenario = ?inner.scenario.as_ref().map(|s| &s.name), "Scenario started");
        Ok(())
    }

    /// Running -> Paused, keeping the remaining delay of the next frame
    pub fn pause(&self) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Running {
            return Err(inner.state_error("pause"));
        }
        inner.cancel_ticks();
        let now = Instant::now();
        inner.cursor.paused_remaining = Some(
            inner
                .cursor
                .next_due
                .map(|due| due.saturating_duration_since(now))
                .unwrap_or_default(),
        );
        inner.transition(EngineState::Paused);
        info!(progress = ?inner.progress(), "Scenario paused");
        Ok(())
    }

    /// Paused -> Running
    pub fn resume(&self) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Paused {
            return Err(inner.state_error("resume"));
        }
        let remaining = inner.cursor.paused_remaining.take().unwrap_or_default();
        inner.cursor.next_due = Some(Instant::now() + remaining);
        inner.transition(EngineState::Running);
        self.spawn_ticks(&mut inner);
        info!(progress = ?inner.progress(), "Scenario resumed");
        Ok(())
    }

    /// Running | Paused -> Completed; already Completed is a no-op
    pub fn stop(&self) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            EngineState::Running | EngineState::Paused => {
                inner.cancel_ticks();
                inner.transition(EngineState::Completed);
                info!(progress = ?inner.progress(), "Scenario stopped");
                Ok(())
            }
            EngineState::Completed => Ok(()),
            _ => Err(inner.state_error("stop")),
        }
    }

    /// Completed | Error -> Idle
    pub fn reset(&self) -> ScenarioResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, EngineState::Completed | EngineState::Error) {
            return Err(inner.state_error("reset"));
        }
        inner.new_run();
        inner.scenario = None;
        inner.last_error = None;
        inner.transition(EngineState::Idle);
        Ok(())
    }

    fn spawn_ticks(&self, inner: &mut Inner) {
        inner.cancel_ticks();
        let token = CancellationToken::new();
        inner.token = Some(token.clone());
        tokio::spawn(tick_loop(
            self.manager.clone(),
            self.inner.clone(),
            self.config.tick(),
            token,
            inner.run,
        ));
    }
}

impl Drop for ScenarioEngine {
    fn drop(&mut self) {
        self.inner.lock().cancel_ticks();
    }
}

async fn tick_loop(
    manager: Arc<CanManager>,
    inner: Arc<Mutex<Inner>>,
    tick: Duration,
    token: CancellationToken,
    run: u64,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Send everything that is due on this tick
        loop {
            if token.is_cancelled() {
                return;
            }

            let next = {
                let mut inner = inner.lock();
                if inner.run != run || inner.state != EngineState::Running {
                    return;
                }
                inner.peek(Instant::now())
            };

            let (link, frame) = match next {
                Next::Send { link, frame } => (link, frame),
                Next::Wait => break,
                Next::Finished => {
                    let mut inner = inner.lock();
                    if inner.run == run && inner.state == EngineState::Running {
                        inner.token = None;
                        inner.transition(EngineState::Completed);
                        info!(progress = ?inner.progress(), "Scenario completed");
                    }
                    return;
                }
            };

            let result = manager.try_send(&link, frame).await;

            let mut inner = inner.lock();
            if inner.run != run {
                // Stopped and reset while this frame was on its way
                debug!(link = %link, %frame, "Discarding send result of a finished run");
                return;
            }
            match result {
                Ok(()) => {
                    trace!(link = %link, %frame, "Scenario frame sent");
                    inner.commit(Instant::now());
                }
                Err(e) => {
                    inner.cursor.in_flight = false;
                    if matches!(inner.state, EngineState::Running | EngineState::Paused) {
                        error!(link = %link, %frame, error = %e, "Scenario send failed");
                        inner.last_error = Some(ScenarioError::Send(e.to_string()));
                        inner.token = None;
                        inner.transition(EngineState::Error);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use canary_core::{
        BackendKind, CanLink, FilterRule, FilterSet, Frame, FrameCallback, FrameTemplate,
        LinkConfig, LinkResult, LinkStatus, StopOutcome,
    };
    use canary_manager::ReceivedFrame;
    use pretty_assertions::assert_eq;

    use crate::model::ScenarioStep;
    use crate::repository::InMemoryScenarioRepository;

    fn step(id: u32, repeat: u32, delay_ms: u64) -> ScenarioStep {
        ScenarioStep::new(
            FrameTemplate::new(id, &[id as u8], false).unwrap(),
            repeat,
            Duration::from_millis(delay_ms),
        )
    }

    async fn running_manager() -> (Arc<CanManager>, Arc<Mutex<Vec<ReceivedFrame>>>) {
        let manager = Arc::new(CanManager::new());
        manager
            .add_link("sim", LinkConfig::virtual_bus("vbus0"))
            .await
            .unwrap();
        assert!(manager.start_all().await.iter().all(|r| r.is_ok()));

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        manager.register_listener(move |r| sink.lock().push(r.clone()));
        (manager, frames)
    }

    async fn wait_for_state(engine: &ScenarioEngine, state: EngineState, limit: Duration) {
        let mut states = engine.watch_state();
        let _ = tokio::time::timeout(limit, states.wait_for(|s| *s == state)).await;
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let (manager, frames) = running_manager().await;
        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());

        engine
            .load(Scenario::new(
                "mixed",
                "sim",
                vec![step(0x10, 2, 2), step(0x20, 0, 50), step(0x30, 3, 2)],
            ))
            .unwrap();
        engine.start().unwrap();
        wait_for_state(&engine, EngineState::Completed, Duration::from_secs(2)).await;
        assert_eq!(engine.state(), EngineState::Completed);

        let progress = engine.progress();
        assert_eq!(progress.frames_sent, 5);
        assert_eq!(progress.total_frames, 5);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let ids: Vec<u32> = frames.lock().iter().map(|r| r.frame.id()).collect();
        assert_eq!(ids, vec![0x10, 0x10, 0x30, 0x30, 0x30]);

        // stop on a completed engine is accepted
        engine.stop().unwrap();
        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_state_guards() {
        let (manager, _) = running_manager().await;
        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());
        let scenario = Scenario::new("slow", "sim", vec![step(0x10, 100, 50)]);

        assert!(matches!(engine.start(), Err(ScenarioError::State(_))));
        assert!(matches!(engine.stop(), Err(ScenarioError::State(_))));
        assert!(matches!(engine.reset(), Err(ScenarioError::State(_))));

        engine.load(scenario.clone()).unwrap();
        assert!(matches!(engine.resume(), Err(ScenarioError::State(_))));
        engine.start().unwrap();
        assert!(matches!(
            engine.load(scenario),
            Err(ScenarioError::State(_))
        ));
        assert!(matches!(engine.reset(), Err(ScenarioError::State(_))));

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
        engine.reset().unwrap();
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_frame_count() {
        let (manager, frames) = running_manager().await;
        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());
        engine
            .load(Scenario::new("counted", "sim", vec![step(0x42, 10, 10)]))
            .unwrap();

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        engine.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let at_pause = engine.progress().frames_sent;
        assert!(at_pause > 0 && at_pause < 10);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.progress().frames_sent, at_pause);

        engine.resume().unwrap();
        wait_for_state(&engine, EngineState::Completed, Duration::from_secs(2)).await;
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(engine.progress().frames_sent, 10);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(frames.lock().len(), 10);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_link_fails_start() {
        let (manager, _) = running_manager().await;
        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());
        engine
            .load(Scenario::new("lost", "nowhere", vec![step(0x1, 1, 0)]))
            .unwrap();

        assert!(matches!(engine.start(), Err(ScenarioError::Send(_))));
        assert_eq!(engine.state(), EngineState::Error);
        assert!(engine.last_error().is_some());
        engine.reset().unwrap();
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_send_failure_moves_to_error() {
        let (manager, _) = running_manager().await;
        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());
        engine
            .load(Scenario::new("halted", "sim", vec![step(0x1, 1, 0)]))
            .unwrap();
        manager.stop_link("sim").await.unwrap();
        engine.start().unwrap();

        wait_for_state(&engine, EngineState::Error, Duration::from_secs(1)).await;
        assert_eq!(engine.state(), EngineState::Error);
        assert!(matches!(engine.last_error(), Some(ScenarioError::Send(_))));
        assert_eq!(engine.progress().frames_sent, 0);

        engine.reset().unwrap();
        assert!(engine.last_error().is_none());
        manager.stop_all().await;
    }

    /// Link whose sends take a while to complete
    struct SlowLink {
        delay: Duration,
        status: Mutex<LinkStatus>,
        sent: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl CanLink for SlowLink {
        fn name(&self) -> &str {
            "slow0"
        }

        fn backend_kind(&self) -> BackendKind {
            BackendKind::Virtual
        }

        fn status(&self) -> LinkStatus {
            *self.status.lock()
        }

        fn set_callback(&self, _callback: FrameCallback) {}

        fn filters(&self) -> FilterSet {
            FilterSet::default()
        }

        async fn configure(&self) -> LinkResult<()> {
            *self.status.lock() = LinkStatus::Configured;
            Ok(())
        }

        async fn start(&self) -> LinkResult<()> {
            *self.status.lock() = LinkStatus::Running;
            Ok(())
        }

        async fn stop(&self) -> LinkResult<StopOutcome> {
            *self.status.lock() = LinkStatus::Unconfigured;
            Ok(StopOutcome::clean(Duration::ZERO))
        }

        async fn send(&self, frame: Frame) -> LinkResult<()> {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().push(frame.id());
            Ok(())
        }

        async fn set_filters(&self, _rules: Vec<FilterRule>) -> LinkResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_from_previous_run_does_not_advance_new_run() {
        let manager = Arc::new(CanManager::new());
        let link = Arc::new(SlowLink {
            delay: Duration::from_millis(150),
            status: Mutex::new(LinkStatus::Unconfigured),
            sent: Mutex::new(Vec::new()),
        });
        manager.add_link_instance("slow", link.clone()).await.unwrap();
        assert!(manager.start_all().await.iter().all(|r| r.is_ok()));

        let engine = ScenarioEngine::new(manager.clone(), EngineConfig::default());
        engine
            .load(Scenario::new("first", "slow", vec![step(0xA, 1, 0)]))
            .unwrap();
        engine.start().unwrap();

        // 0xA is still on its way when the engine moves on to the next run
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.stop().unwrap();
        engine.reset().unwrap();
        engine
            .load(Scenario::new("second", "slow", vec![step(0xB, 3, 0)]))
            .unwrap();
        engine.start().unwrap();

        wait_for_state(&engine, EngineState::Completed, Duration::from_secs(3)).await;
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(engine.last_error().is_none());
        assert_eq!(engine.progress().frames_sent, 3);

        let sent = link.sent.lock().clone();
        assert_eq!(sent.iter().filter(|id| **id == 0xB).count(), 3);
        assert_eq!(sent.iter().filter(|id| **id == 0xA).count(), 1);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_load_from_repository() {
        let manager = Arc::new(CanManager::new());
        let engine = ScenarioEngine::new(manager, EngineConfig::default());
        let repo = InMemoryScenarioRepository::from_scenarios(vec![Scenario::new(
            "stored",
            "sim",
            vec![step(0x7, 1, 0)],
        )])
        .unwrap();

        assert_eq!(
            engine.load_from(&repo, "missing").await.unwrap_err(),
            ScenarioError::NotFound("missing".into())
        );
        engine.load_from(&repo, "stored").await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.scenario_name().as_deref(), Some("stored"));
    }

    #[test]
    fn test_cursor_skips_empty_steps_and_honours_delays() {
        let (states, _) = watch::channel(EngineState::Running);
        let mut inner = Inner {
            state: EngineState::Running,
            states,
            scenario: Some(Scenario::new(
                "unit",
                "sim",
                vec![step(0x1, 1, 20), step(0x2, 0, 0), step(0x3, 1, 0)],
            )),
            cursor: Cursor::default(),
            last_error: None,
            token: None,
            run: 0,
        };
        let t0 = Instant::now();

        assert!(matches!(inner.peek(t0), Next::Send { frame, .. } if frame.id() == 0x1));
        // in flight: nothing else goes out until the commit
        assert!(matches!(inner.peek(t0), Next::Wait));
        inner.commit(t0);

        // next step's first frame waits for the previous step's delay
        assert!(matches!(inner.peek(t0 + Duration::from_millis(10)), Next::Wait));
        let later = t0 + Duration::from_millis(20);
        assert!(matches!(inner.peek(later), Next::Send { frame, .. } if frame.id() == 0x3));
        inner.commit(later);
        assert!(matches!(inner.peek(later), Next::Finished));
        assert_eq!(inner.progress().frames_sent, 2);
    }
}
