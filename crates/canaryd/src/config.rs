//! Daemon configuration file

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use canary_core::LinkConfig;
use canary_scenario::{EngineConfig, Scenario};
use serde::Deserialize;

/// One `[[links]]` table: a manager name plus the link settings
#[derive(Debug, Clone, Deserialize)]
pub struct LinkEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: LinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Overrides the grace period of every link when set
    #[serde(default)]
    pub grace_period_ms: Option<u64>,
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

fn default_tick() -> u64 {
    EngineConfig::default().tick_ms
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.links {
            if !seen.insert(entry.name.as_str()) {
                anyhow::bail!("Duplicate link name '{}'", entry.name);
            }
        }
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.contains(scenario.link.as_str()) {
                anyhow::bail!(
                    "Scenario '{}' targets unknown link '{}'",
                    scenario.name,
                    scenario.link
                );
            }
        }
        Ok(())
    }

    /// Link settings with the global grace period applied
    pub fn link_configs(&self) -> Vec<(String, LinkConfig)> {
        self.links
            .iter()
            .map(|entry| {
                let config = match self.grace_period_ms {
                    Some(ms) => entry
                        .config
                        .clone()
                        .with_grace_period(Duration::from_millis(ms)),
                    None => entry.config.clone(),
                };
                (entry.name.clone(), config)
            })
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_ms: self.tick_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_core::BackendKind;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = include_str!("../config/sim.toml");

    #[test]
    fn test_parse_sample() {
        let config = DaemonConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.tick_ms, 5);
        assert_eq!(config.links.len(), 1);

        let link = &config.links[0];
        assert_eq!(link.name, "sim");
        assert_eq!(link.config.channel, "vbus0");
        assert_eq!(link.config.backend_kind, BackendKind::Virtual);
        assert_eq!(link.config.simulation.send_latency_ms, 1);

        assert_eq!(config.scenarios.len(), 1);
        assert_eq!(config.scenarios[0].total_frames(), 7);
    }

    #[test]
    fn test_global_grace_period_applies_to_links() {
        let config = DaemonConfig::parse(
            r#"
            grace_period_ms = 250
            [[links]]
            name = "a"
            channel = "vbus0"
            backend_kind = "virtual"
            grace_period_ms = 5000
            "#,
        )
        .unwrap();
        let links = config.link_configs();
        assert_eq!(links[0].1.grace_period(), Duration::from_millis(250));
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_rejects_duplicate_links() {
        let err = DaemonConfig::parse(
            r#"
            [[links]]
            name = "a"
            channel = "vbus0"
            backend_kind = "virtual"
            [[links]]
            name = "a"
            channel = "vbus1"
            backend_kind = "virtual"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate link"));
    }

    #[test]
    fn test_rejects_scenario_on_unknown_link() {
        let err = DaemonConfig::parse(
            r#"
            [[scenarios]]
            name = "idle"
            link = "ghost"
            [[scenarios.steps]]
            id = 0x100
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown link"));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(DaemonConfig::parse(
            r#"
            [[links]]
            name = "a"
            channel = "x"
            backend_kind = "pcan"
            "#,
        )
        .is_err());
    }
}
