//! Scripted traffic for exercising a virtual bus

use std::time::Duration;

use canary_core::{FrameError, FrameTemplate};
use serde::{Deserialize, Serialize};

/// One frame template sent `repeat_count` times, `interval` apart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub frame: FrameTemplate,
    #[serde(default = "default_repeat")]
    pub repeat_count: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

fn default_repeat() -> u32 {
    1
}

impl TrafficEntry {
    pub fn new(frame: FrameTemplate, repeat_count: u32, interval: Duration) -> Self {
        Self {
            frame,
            repeat_count,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Pause after each send of this entry
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Ordered entries, the whole sequence replayed `cycles` times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPattern {
    pub name: String,
    pub entries: Vec<TrafficEntry>,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
}

fn default_cycles() -> u32 {
    1
}

impl TrafficPattern {
    pub fn new(name: impl Into<String>, entries: Vec<TrafficEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
            cycles: default_cycles(),
        }
    }

    pub fn with_cycles(self, cycles: u32) -> Self {
        Self { cycles, ..self }
    }

    /// `count` copies of one frame, `period` apart
    pub fn heartbeat(
        id: u32,
        data: &[u8],
        period: Duration,
        count: u32,
    ) -> Result<Self, FrameError> {
        let frame = FrameTemplate::new(id, data, id > canary_core::MAX_STANDARD_ID)?;
        Ok(Self::new(
            "heartbeat",
            vec![TrafficEntry::new(frame, count, period)],
        ))
    }

    /// `count` back-to-back frames carrying a one-byte sequence counter
    pub fn burst(id: u32, count: u32) -> Result<Self, FrameError> {
        let extended = id > canary_core::MAX_STANDARD_ID;
        let entries = (0..count)
            .map(|seq| {
                FrameTemplate::new(id, &[seq as u8], extended)
                    .map(|frame| TrafficEntry::new(frame, 1, Duration::ZERO))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new("burst", entries))
    }

    /// Frames one full replay would attempt
    pub fn frame_count(&self) -> usize {
        let per_cycle: usize = self.entries.iter().map(|e| e.repeat_count as usize).sum();
        per_cycle * self.cycles as usize
    }
}

/// Outcome of replaying a pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficReport {
    pub attempted: u64,
    pub accepted: u64,
    pub rejected: u64,
}
