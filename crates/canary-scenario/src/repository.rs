//! Scenario storage boundary

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ScenarioError, ScenarioResult};
use crate::model::Scenario;

/// Where scenarios come from; persistent stores live outside this crate
#[async_trait]
pub trait ScenarioRepository: Send + Sync {
    async fn get(&self, name: &str) -> ScenarioResult<Scenario>;

    async fn list(&self) -> ScenarioResult<Vec<String>>;

    /// Insert or replace by name
    async fn save(&self, scenario: Scenario) -> ScenarioResult<()>;
}

#[derive(Default)]
pub struct InMemoryScenarioRepository {
    scenarios: RwLock<BTreeMap<String, Scenario>>,
}

impl InMemoryScenarioRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from already validated scenarios
    pub fn from_scenarios(scenarios: impl IntoIterator<Item = Scenario>) -> ScenarioResult<Self> {
        let mut map = BTreeMap::new();
        for scenario in scenarios {
            scenario.validate()?;
            map.insert(scenario.name.clone(), scenario);
        }
        Ok(Self {
            scenarios: RwLock::new(map),
        })
    }
}

#[async_trait]
impl ScenarioRepository for InMemoryScenarioRepository {
    async fn get(&self, name: &str) -> ScenarioResult<Scenario> {
        self.scenarios
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ScenarioError::NotFound(name.to_string()))
    }

    async fn list(&self) -> ScenarioResult<Vec<String>> {
        Ok(self.scenarios.read().keys().cloned().collect())
    }

    async fn save(&self, scenario: Scenario) -> ScenarioResult<()> {
        scenario.validate()?;
        debug!(scenario = %scenario.name, steps = scenario.steps.len(), "Scenario saved");
        self.scenarios.write().insert(scenario.name.clone(), scenario);
        Ok(())
    }
}
