//! Scenario definitions

use std::time::Duration;

use canary_core::FrameTemplate;
use serde::{Deserialize, Serialize};

use crate::error::{ScenarioError, ScenarioResult};

/// One frame template sent `repeat_count` times, `inter_frame_delay` apart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub frame: FrameTemplate,
    #[serde(default = "default_repeat")]
    pub repeat_count: u32,
    #[serde(default)]
    pub inter_frame_delay_ms: u64,
}

fn default_repeat() -> u32 {
    1
}

impl ScenarioStep {
    pub fn new(frame: FrameTemplate, repeat_count: u32, inter_frame_delay: Duration) -> Self {
        Self {
            frame,
            repeat_count,
            inter_frame_delay_ms: inter_frame_delay.as_millis() as u64,
        }
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_millis(self.inter_frame_delay_ms)
    }
}

/// Ordered steps sent through one managed link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Name of the manager link the frames go out on
    pub link: String,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, link: impl Into<String>, steps: Vec<ScenarioStep>) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            steps,
        }
    }

    pub fn validate(&self) -> ScenarioResult<()> {
        if self.name.trim().is_empty() {
            return Err(ScenarioError::InvalidScenario(
                "scenario name cannot be empty".to_string(),
            ));
        }
        if self.link.trim().is_empty() {
            return Err(ScenarioError::InvalidScenario(format!(
                "scenario {} has no target link",
                self.name
            )));
        }
        if self.steps.is_empty() {
            return Err(ScenarioError::InvalidScenario(format!(
                "scenario {} has no steps",
                self.name
            )));
        }
        Ok(())
    }

    /// Frames a complete run sends
    pub fn total_frames(&self) -> u64 {
        self.steps.iter().map(|s| s.repeat_count as u64).sum()
    }
}
