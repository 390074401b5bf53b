//! Simulation configuration loading
//!
//! A TOML file supplies the base `SimulationConfig`; command-line flags are
//! applied on top and the result is validated once.

use anyhow::{Context, Result};
use particle_lab::{ParticleCount, SimulationConfig};
use std::fs;
use std::path::Path;

/// Flags that take precedence over the config file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub count: Option<usize>,
    pub seed: Option<u64>,
    pub darken: Option<f32>,
}

/// Load `path` if given, else defaults, then apply `overrides`
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<SimulationConfig> {
    let source = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };
    from_source(source.as_deref(), overrides)
}

fn from_source(source: Option<&str>, overrides: &Overrides) -> Result<SimulationConfig> {
    let mut config = match source {
        Some(source) => toml::from_str(source).context("Failed to parse simulation config")?,
        None => SimulationConfig::default(),
    };
    apply(&mut config, overrides)?;
    config.validate().context("Invalid simulation config")?;
    Ok(config)
}

fn apply(config: &mut SimulationConfig, overrides: &Overrides) -> Result<()> {
    if let Some(count) = overrides.count {
        config.particle_count = parse_count(count)?;
    }
    if let Some(seed) = overrides.seed {
        config.seed = Some(seed);
    }
    if let Some(decay) = overrides.darken {
        config.darken_decay = Some(decay);
        config.clear_on_step = false;
    }
    Ok(())
}

/// Map a raw particle count to one of the supported sizes
pub fn parse_count(count: usize) -> Result<ParticleCount> {
    ParticleCount::from_len(count).with_context(|| {
        let supported: Vec<String> = ParticleCount::ALL
            .iter()
            .map(|c| c.get().to_string())
            .collect();
        format!(
            "Unsupported particle count {}. Supported counts: {}",
            count,
            supported.join(", ")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_lab::Distribution;

    #[test]
    fn test_defaults_without_file() {
        let config = from_source(None, &Overrides::default()).unwrap();
        assert_eq!(config, SimulationConfig::default());
    }

    #[test]
    fn test_file_values_and_overrides() {
        let source = r#"
            width = 320
            height = 180
            particle_count = "one_million"
            distribution = "gaussian"
            seed = 3
        "#;
        let overrides = Overrides {
            count: Some(1 << 19),
            seed: Some(9),
            darken: None,
        };
        let config = from_source(Some(source), &overrides).unwrap();

        assert_eq!(config.width, 320);
        assert_eq!(config.height, 180);
        assert_eq!(config.distribution, Distribution::Gaussian);
        assert_eq!(config.particle_count, ParticleCount::HalfMillion);
        assert_eq!(config.seed, Some(9));
    }

    #[test]
    fn test_darken_override_disables_clearing() {
        let overrides = Overrides {
            darken: Some(0.9),
            ..Default::default()
        };
        let config = from_source(None, &overrides).unwrap();
        assert_eq!(config.darken_decay, Some(0.9));
        assert!(!config.clear_on_step);
    }

    #[test]
    fn test_rejects_unsupported_count() {
        let err = parse_count(1000).unwrap_err();
        assert!(err.to_string().contains("262144"));
    }

    #[test]
    fn test_rejects_invalid_file() {
        assert!(from_source(Some("drag_factor = 1.5"), &Overrides::default()).is_err());
        assert!(from_source(Some("width = \"wide\""), &Overrides::default()).is_err());
    }
}
