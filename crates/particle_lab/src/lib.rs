//! Particle Lab
//!
//! GPU particle simulation and image filtering using wgpu.
//!
//! # Features
//!
//! - **Shared particle region**: page-aligned host memory imported once into a GPU storage buffer
//! - **Frame driver**: clear, simulate, darken and present in one submission per frame
//! - **Image filters**: camera frames through compute kernels with declared parameter tables
//! - **CPU reference kernel**: the WGSL math on the host, for tests and parity checks
//!
//! # Example
//!
//! ```ignore
//! use particle_lab::{FrameDriver, NullObserver, SimulationConfig};
//!
//! let mut driver = FrameDriver::headless(SimulationConfig::default(), Box::new(NullObserver))?;
//! for _ in 0..100 {
//!     driver.step();
//! }
//! let frame = driver.read_output()?;
//! ```

pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod frame;
pub mod initializer;
pub mod input;
pub mod observer;
pub mod pipeline;
pub mod reference;
pub mod shaders;
pub mod stats;
pub mod target;

pub use buffer::{GpuParticleView, Particle, ParticleBuffer, IMPORT_ALIGNMENT};
pub use cache::TextureCache;
pub use config::{Distribution, ParticleColor, ParticleCount, SimulationConfig};
pub use device::{AdapterInfo, GpuContext};
pub use error::{ParticleLabError, Result};
pub use filter::{
    FilterKernel, FilterParameterDescriptor, FilterSource, FilteredImage, ImageFilterBridge,
    ParameterKind, ParameterValue, ParticleCamFilter, TintFilter,
};
pub use frame::{DropReason, FrameDriver, FrameOutcome, FramePhase};
pub use initializer::ParticleInitializer;
pub use input::ImageInbox;
pub use observer::{ChannelObserver, EventDispatcher, FrameEvent, FrameObserver, NullObserver};
pub use pipeline::{ComputeKernelPipeline, DispatchGeometry};
pub use shaders::{KernelShape, ShaderLibrary};
pub use stats::FrameStatistics;
pub use target::{Extent, RenderTarget};
