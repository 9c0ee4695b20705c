//! Scripted CAN traffic
//!
//! A [`Scenario`] is an ordered list of frame templates, each repeated with a
//! fixed delay. The [`ScenarioEngine`] plays one scenario at a time through a
//! [`canary_manager::CanManager`] link and can be paused, resumed and stopped.

pub mod engine;
pub mod error;
pub mod model;
pub mod repository;

pub use engine::{EngineConfig, EngineState, ScenarioEngine, ScenarioProgress};
pub use error::{ScenarioError, ScenarioResult};
pub use model::{Scenario, ScenarioStep};
pub use repository::{InMemoryScenarioRepository, ScenarioRepository};
