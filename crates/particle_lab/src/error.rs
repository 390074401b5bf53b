//! Error types for particle_lab

use thiserror::Error;

/// Errors that can occur while building or driving a simulation
#[derive(Error, Debug)]
pub enum ParticleLabError {
    /// No usable GPU adapter was found
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The adapter refused the device request
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// The particle region could not be allocated with the import alignment
    #[error("Cannot allocate {bytes} bytes aligned to {align}")]
    Allocation { bytes: usize, align: usize },

    /// A compute program name is not present in the shader library
    #[error("Unknown compute program '{0}'")]
    UnknownProgram(String),

    /// A compute program failed to compile or link on the current device
    #[error("Compute program '{program}' failed to build: {message}")]
    Compilation { program: String, message: String },

    /// Two filter bindings claim the same index
    #[error("Binding index {binding} is declared twice ('{name}')")]
    DuplicateBinding { binding: u32, name: String },

    /// A filter parameter name is not in the filter's table
    #[error("Unknown filter parameter '{0}'")]
    UnknownParameter(String),

    /// A scalar was written to a color parameter or the other way round
    #[error("Filter parameter '{0}' has a different kind")]
    ParameterKind(String),

    /// A filter that consumes an image was applied without one
    #[error("Filter '{0}' requires an input image")]
    MissingInput(String),

    /// Configuration values out of range or contradictory
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Mapping a readback buffer failed
    #[error("GPU readback failed: {0}")]
    Readback(String),
}

/// Result type for particle_lab operations
pub type Result<T> = std::result::Result<T, ParticleLabError>;
