//! Simulation configuration
//!
//! The configuration surface is owned by the embedding application. It can be
//! built in code or read from a TOML document:
//!
//! ```toml
//! width = 640
//! height = 360
//! particle_count = "one_million"
//! drag_factor = 0.97
//! respawn_out_of_bounds = true
//! clear_on_step = true
//! distribution = "gaussian"
//!
//! [particle_color]
//! r = 1.0
//! g = 0.5
//! b = 0.2
//! a = 1.0
//! ```

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{ParticleLabError, Result};

/// Supported particle population sizes
///
/// All values are powers of two so that every power-of-two execution
/// granularity up to 2^18 divides them exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleCount {
    QuarterMillion,
    HalfMillion,
    OneMillion,
    TwoMillion,
    FourMillion,
}

impl ParticleCount {
    pub const ALL: [ParticleCount; 5] = [
        ParticleCount::QuarterMillion,
        ParticleCount::HalfMillion,
        ParticleCount::OneMillion,
        ParticleCount::TwoMillion,
        ParticleCount::FourMillion,
    ];

    pub fn get(self) -> usize {
        match self {
            ParticleCount::QuarterMillion => 1 << 18,
            ParticleCount::HalfMillion => 1 << 19,
            ParticleCount::OneMillion => 1 << 20,
            ParticleCount::TwoMillion => 1 << 21,
            ParticleCount::FourMillion => 1 << 22,
        }
    }

    /// Map a raw count back to a supported size
    pub fn from_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.get() == len)
    }
}

impl Default for ParticleCount {
    fn default() -> Self {
        ParticleCount::QuarterMillion
    }
}

/// Spatial distribution used when seeding particle positions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    #[default]
    Uniform,
    Gaussian,
}

/// Base particle color (RGBA)
///
/// Particles are split into three classes by index: the base color draws one
/// third, the other two use the same components rotated to BRG and GBR.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Deserialize, Serialize)]
pub struct ParticleColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    #[serde(default = "opaque")]
    pub a: f32,
}

fn opaque() -> f32 {
    1.0
}

impl ParticleColor {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for ParticleColor {
    fn default() -> Self {
        Self::new(1.0, 0.5, 0.2, 1.0)
    }
}

/// Everything the core consumes from the outside world
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Logical image width; the render target is twice as wide
    pub width: u32,
    /// Logical image height; the render target is twice as tall
    pub height: u32,
    pub particle_count: ParticleCount,
    /// Per-step velocity multiplier in (0, 1]; 1.0 means no decay
    pub drag_factor: f32,
    pub respawn_out_of_bounds: bool,
    /// Zero the render target before each frame
    pub clear_on_step: bool,
    /// Fade the render target by this factor after each frame instead of clearing
    pub darken_decay: Option<f32>,
    pub particle_color: ParticleColor,
    pub distribution: Distribution,
    /// Seed particles on the four image edges only
    pub edges_only: bool,
    /// Seed for reproducible initial state; `None` draws from the process generator
    pub seed: Option<u64>,
    /// Drop frames until an external image has been submitted
    pub require_input_image: bool,
    /// Override the device-derived thread-group width
    pub execution_granularity: Option<u32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            particle_count: ParticleCount::default(),
            drag_factor: 0.97,
            respawn_out_of_bounds: true,
            clear_on_step: true,
            darken_decay: None,
            particle_color: ParticleColor::default(),
            distribution: Distribution::Uniform,
            edges_only: false,
            seed: None,
            require_input_image: false,
            execution_granularity: None,
        }
    }
}

impl SimulationConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Render target extent in pixels
    pub fn target_extent(&self) -> (u32, u32) {
        (self.width * 2, self.height * 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ParticleLabError::InvalidConfig(format!(
                "image extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.drag_factor > 0.0 && self.drag_factor <= 1.0) {
            return Err(ParticleLabError::InvalidConfig(format!(
                "drag_factor must lie in (0, 1], got {}",
                self.drag_factor
            )));
        }
        if let Some(decay) = self.darken_decay {
            if !(decay > 0.0 && decay < 1.0) {
                return Err(ParticleLabError::InvalidConfig(format!(
                    "darken_decay must lie in (0, 1), got {decay}"
                )));
            }
            if self.clear_on_step {
                return Err(ParticleLabError::InvalidConfig(
                    "clear_on_step and darken_decay are mutually exclusive".to_string(),
                ));
            }
        }
        if let Some(granularity) = self.execution_granularity {
            if granularity == 0 || !granularity.is_power_of_two() {
                return Err(ParticleLabError::InvalidConfig(format!(
                    "execution_granularity must be a power of two, got {granularity}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_counts_are_powers_of_two() {
        let counts: Vec<usize> = ParticleCount::ALL.iter().map(|c| c.get()).collect();
        assert_eq!(counts, vec![262_144, 524_288, 1_048_576, 2_097_152, 4_194_304]);
        assert!(counts.iter().all(|c| c.is_power_of_two()));
        assert_eq!(ParticleCount::from_len(1_048_576), Some(ParticleCount::OneMillion));
        assert_eq!(ParticleCount::from_len(1_000_000), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.target_extent(), (1280, 720));
    }

    #[test]
    fn test_drag_out_of_range_rejected() {
        for drag in [0.0, -0.5, 1.01, f32::NAN] {
            let config = SimulationConfig {
                drag_factor: drag,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ParticleLabError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_fade_policies_are_exclusive() {
        let config = SimulationConfig {
            clear_on_step: true,
            darken_decay: Some(0.9),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SimulationConfig {
            clear_on_step: false,
            darken_decay: Some(0.9),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config = SimulationConfig::from_toml_str(
            r#"
            width = 320
            height = 240
            particle_count = "two_million"
            distribution = "gaussian"
            edges_only = true
            seed = 7

            [particle_color]
            r = 0.1
            g = 0.2
            b = 0.3
            "#,
        )
        .unwrap();

        assert_eq!(config.width, 320);
        assert_eq!(config.particle_count, ParticleCount::TwoMillion);
        assert_eq!(config.distribution, Distribution::Gaussian);
        assert!(config.edges_only);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.particle_color, ParticleColor::new(0.1, 0.2, 0.3, 1.0));
        assert_eq!(config.drag_factor, 0.97);
    }

    #[test]
    fn test_parse_rejects_bad_granularity() {
        let err = SimulationConfig::from_toml_str("execution_granularity = 48").unwrap_err();
        assert!(matches!(err, ParticleLabError::InvalidConfig(_)));
    }
}
