//! Image filters on the compute pipeline
//!
//! An [`ImageFilterBridge`] turns an external image into a texture, runs one
//! compute kernel over it and hands back the output texture. What the kernel
//! is, which parameters it takes and which extra buffers it binds comes from
//! a [`FilterKernel`] implementation.
//!
//! Bindings are fixed per filter source:
//!
//! | source      | input texture | output texture | parameters, custom buffers |
//! |-------------|---------------|----------------|----------------------------|
//! | `Image`     | 0             | 1              | declared by the kernel     |
//! | `Generator` | none          | 0              | declared by the kernel     |

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use smallvec::SmallVec;

use crate::buffer::{Particle, ParticleBuffer};
use crate::cache::TextureCache;
use crate::config::{Distribution, ParticleColor};
use crate::device::GpuContext;
use crate::error::{ParticleLabError, Result};
use crate::initializer::ParticleInitializer;
use crate::pipeline::{layout, ComputeKernelPipeline, DispatchGeometry};
use crate::shaders::{self, ShaderLibrary};
use crate::target::{self, Extent, ZeroFill};

/// Where a filter's input extent comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterSource {
    /// Consumes an external image; output matches its extent
    Image,
    /// Produces an image of a fixed extent from nothing
    Generator { width: u32, height: u32 },
}

impl FilterSource {
    pub fn is_source_image(&self) -> bool {
        matches!(self, FilterSource::Image)
    }

    /// Extent of the output for `input`; `None` when an image is required
    /// but missing
    pub fn resolve_input_extent(&self, input: Option<&RgbaImage>) -> Option<Extent> {
        match self {
            FilterSource::Image => input.map(Extent::of_image),
            FilterSource::Generator { width, height } => Some(Extent::new(*width, *height)),
        }
    }

    pub fn input_binding(&self) -> Option<u32> {
        match self {
            FilterSource::Image => Some(0),
            FilterSource::Generator { .. } => None,
        }
    }

    pub fn output_binding(&self) -> u32 {
        match self {
            FilterSource::Image => 1,
            FilterSource::Generator { .. } => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    Scalar,
    Color,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParameterValue {
    Scalar(f32),
    Color(ParticleColor),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Scalar(_) => ParameterKind::Scalar,
            ParameterValue::Color(_) => ParameterKind::Color,
        }
    }

    /// 16-byte uniform payload; scalars occupy the first lane
    pub fn to_uniform(self) -> [f32; 4] {
        match self {
            ParameterValue::Scalar(value) => [value, 0.0, 0.0, 0.0],
            ParameterValue::Color(color) => color.to_array(),
        }
    }
}

/// One entry of a filter's parameter table
#[derive(Clone, Debug, PartialEq)]
pub struct FilterParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
    pub binding: u32,
    pub default: ParameterValue,
}

impl FilterParameterDescriptor {
    pub fn scalar(name: &str, binding: u32, default: f32) -> Self {
        Self {
            name: name.to_string(),
            kind: ParameterKind::Scalar,
            binding,
            default: ParameterValue::Scalar(default),
        }
    }

    pub fn color(name: &str, binding: u32, default: ParticleColor) -> Self {
        Self {
            name: name.to_string(),
            kind: ParameterKind::Color,
            binding,
            default: ParameterValue::Color(default),
        }
    }
}

/// What a filter contributes to the bridge
pub trait FilterKernel {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Program name in the shader library
    fn program(&self) -> &str;

    fn source(&self) -> FilterSource;

    fn parameters(&self) -> Vec<FilterParameterDescriptor>;

    /// Bindings of filter-owned storage buffers
    fn custom_bindings(&self) -> SmallVec<[u32; 4]> {
        SmallVec::new()
    }

    /// Make custom buffers ready on `gpu` before each dispatch
    fn prepare(&mut self, _gpu: &GpuContext) -> Result<()> {
        Ok(())
    }

    /// Buffer for one of `custom_bindings`
    fn custom_buffer(&self, _binding: u32) -> Option<&wgpu::Buffer> {
        None
    }

    /// Dispatch geometry; `None` means one thread per output pixel
    fn custom_geometry(&self, _granularity: u32) -> Option<DispatchGeometry> {
        None
    }

    /// WGSL `override` values for the program
    fn constants(&self) -> HashMap<String, f64> {
        HashMap::new()
    }

    /// Zero the output before each dispatch
    fn clear_on_step(&self) -> bool {
        false
    }
}

/// What occupies one binding index
#[derive(Clone, Debug, PartialEq)]
pub enum BindingSlot {
    InputTexture,
    OutputTexture,
    Parameter(String),
    CustomBuffer,
}

impl BindingSlot {
    fn describe(&self) -> String {
        match self {
            BindingSlot::InputTexture => "input texture".to_string(),
            BindingSlot::OutputTexture => "output texture".to_string(),
            BindingSlot::Parameter(name) => name.clone(),
            BindingSlot::CustomBuffer => "custom buffer".to_string(),
        }
    }
}

/// Collect every binding a filter uses, rejecting duplicates
pub fn collect_bindings(
    source: FilterSource,
    parameters: &[FilterParameterDescriptor],
    custom: &[u32],
) -> Result<Vec<(u32, BindingSlot)>> {
    let mut slots: Vec<(u32, BindingSlot)> = Vec::new();
    let mut claim = |binding: u32, slot: BindingSlot| {
        if slots.iter().any(|(b, _)| *b == binding) {
            return Err(ParticleLabError::DuplicateBinding {
                binding,
                name: slot.describe(),
            });
        }
        slots.push((binding, slot));
        Ok(())
    };

    if let Some(binding) = source.input_binding() {
        claim(binding, BindingSlot::InputTexture)?;
    }
    claim(source.output_binding(), BindingSlot::OutputTexture)?;
    for parameter in parameters {
        claim(parameter.binding, BindingSlot::Parameter(parameter.name.clone()))?;
    }
    for &binding in custom {
        claim(binding, BindingSlot::CustomBuffer)?;
    }

    slots.sort_by_key(|(binding, _)| *binding);
    Ok(slots)
}

struct BoundParameter {
    descriptor: FilterParameterDescriptor,
    value: ParameterValue,
    buffer: wgpu::Buffer,
}

struct FilterTextures {
    input: Option<wgpu::Texture>,
    output: Arc<wgpu::Texture>,
    zero_fill: ZeroFill,
}

impl FilterTextures {
    fn new(gpu: &GpuContext, extent: Extent, with_input: bool) -> Self {
        Self {
            input: with_input.then(|| target::create_input_texture(gpu, extent, "Filter Input")),
            output: Arc::new(target::create_storage_texture(gpu, extent, "Filter Output")),
            zero_fill: ZeroFill::new(gpu, extent),
        }
    }
}

/// Result of one filter application
///
/// Holds the output texture alive even after the bridge reallocates.
#[derive(Clone)]
pub struct FilteredImage {
    gpu: GpuContext,
    texture: Arc<wgpu::Texture>,
}

impl FilteredImage {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.texture.width(), self.texture.height())
    }

    /// Copy the pixels back to the host (blocking)
    pub fn read_back(&self) -> Result<RgbaImage> {
        target::read_texture(&self.gpu, &self.texture)
    }
}

/// Runs a [`FilterKernel`] over images
pub struct ImageFilterBridge<K: FilterKernel> {
    gpu: GpuContext,
    kernel: K,
    pipeline: ComputeKernelPipeline,
    slots: Vec<(u32, BindingSlot)>,
    parameters: SmallVec<[BoundParameter; 4]>,
    textures: TextureCache<FilterTextures>,
}

impl<K: FilterKernel> ImageFilterBridge<K> {
    pub fn new(gpu: GpuContext, kernel: K) -> Result<Self> {
        Self::with_library(gpu, kernel, &ShaderLibrary::builtin())
    }

    pub fn with_library(gpu: GpuContext, kernel: K, library: &ShaderLibrary) -> Result<Self> {
        let source = kernel.source();
        let descriptors = kernel.parameters();
        let slots = collect_bindings(source, &descriptors, &kernel.custom_bindings())?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
            .iter()
            .map(|(binding, slot)| match slot {
                BindingSlot::InputTexture => layout::sampled_texture(*binding),
                BindingSlot::OutputTexture => layout::storage_texture(*binding),
                BindingSlot::Parameter(_) => layout::uniform_buffer(*binding),
                BindingSlot::CustomBuffer => layout::storage_buffer(*binding),
            })
            .collect();

        let granularity = gpu.execution_granularity(None);
        let pipeline = ComputeKernelPipeline::build(
            &gpu,
            library,
            kernel.program(),
            &entries,
            granularity,
            &kernel.constants(),
        )?;

        let parameters = descriptors
            .into_iter()
            .map(|descriptor| {
                let buffer = gpu.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&descriptor.name),
                    size: 16,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let value = descriptor.default;
                gpu.queue()
                    .write_buffer(&buffer, 0, bytemuck::cast_slice(&value.to_uniform()));
                BoundParameter {
                    descriptor,
                    value,
                    buffer,
                }
            })
            .collect();

        tracing::debug!(
            "Filter '{}' bound to program '{}' ({} bindings)",
            kernel.name(),
            kernel.program(),
            slots.len()
        );

        Ok(Self {
            gpu,
            kernel,
            pipeline,
            slots,
            parameters,
            textures: TextureCache::new(),
        })
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Bindings in index order
    pub fn bindings(&self) -> &[(u32, BindingSlot)] {
        &self.slots
    }

    /// Times the input/output texture pair was (re)allocated
    pub fn texture_allocations(&self) -> u32 {
        self.textures.allocations()
    }

    pub fn parameter(&self, name: &str) -> Option<ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.descriptor.name == name)
            .map(|p| p.value)
    }

    pub fn set_scalar(&mut self, name: &str, value: f32) -> Result<()> {
        self.set_parameter(name, ParameterValue::Scalar(value))
    }

    pub fn set_color(&mut self, name: &str, color: ParticleColor) -> Result<()> {
        self.set_parameter(name, ParameterValue::Color(color))
    }

    fn set_parameter(&mut self, name: &str, value: ParameterValue) -> Result<()> {
        let parameter = self
            .parameters
            .iter_mut()
            .find(|p| p.descriptor.name == name)
            .ok_or_else(|| ParticleLabError::UnknownParameter(name.to_string()))?;
        if parameter.descriptor.kind != value.kind() {
            return Err(ParticleLabError::ParameterKind(name.to_string()));
        }
        parameter.value = value;
        self.gpu.queue().write_buffer(
            &parameter.buffer,
            0,
            bytemuck::cast_slice(&value.to_uniform()),
        );
        Ok(())
    }

    /// Run the filter once
    ///
    /// Image filters need `input`; generators ignore it. The texture pair is
    /// reused while the extent stays the same.
    pub fn apply(&mut self, input: Option<&RgbaImage>) -> Result<FilteredImage> {
        let source = self.kernel.source();
        let extent = source
            .resolve_input_extent(input)
            .ok_or_else(|| ParticleLabError::MissingInput(self.kernel.name().to_string()))?;
        if extent.width == 0 || extent.height == 0 {
            return Err(ParticleLabError::InvalidConfig(format!(
                "filter '{}' cannot run on an empty {}x{} image",
                self.kernel.name(),
                extent.width,
                extent.height
            )));
        }

        self.kernel.prepare(&self.gpu)?;

        let gpu = &self.gpu;
        let textures = self.textures.get_or_create(extent, |extent| {
            FilterTextures::new(gpu, extent, source.is_source_image())
        });
        if let (Some(texture), Some(image)) = (&textures.input, input) {
            target::upload_image(gpu, texture, image);
        }

        let input_view = textures
            .input
            .as_ref()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let output_view = textures
            .output
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut entries: SmallVec<[wgpu::BindGroupEntry<'_>; 8]> = SmallVec::new();
        for (binding, slot) in &self.slots {
            let resource = match slot {
                BindingSlot::InputTexture => match &input_view {
                    Some(view) => wgpu::BindingResource::TextureView(view),
                    None => return Err(ParticleLabError::MissingInput(self.kernel.name().to_string())),
                },
                BindingSlot::OutputTexture => wgpu::BindingResource::TextureView(&output_view),
                BindingSlot::Parameter(name) => self
                    .parameters
                    .iter()
                    .find(|p| &p.descriptor.name == name)
                    .map(|p| p.buffer.as_entire_binding())
                    .ok_or_else(|| ParticleLabError::UnknownParameter(name.clone()))?,
                BindingSlot::CustomBuffer => self
                    .kernel
                    .custom_buffer(*binding)
                    .map(|buffer| buffer.as_entire_binding())
                    .ok_or_else(|| {
                        ParticleLabError::InvalidConfig(format!(
                            "filter '{}' has no buffer for binding {}",
                            self.kernel.name(),
                            binding
                        ))
                    })?,
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }
        let bind_group = self.pipeline.bind_group(gpu, &entries);

        let geometry = self
            .kernel
            .custom_geometry(self.pipeline.thread_execution_granularity())
            .unwrap_or_else(|| DispatchGeometry::for_image(extent.width, extent.height));

        let mut encoder = gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Filter Encoder"),
            });
        if self.kernel.clear_on_step() {
            textures.zero_fill.encode(&mut encoder, &textures.output);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.kernel.name()),
                timestamp_writes: None,
            });
            self.pipeline.dispatch(&mut pass, &bind_group, &geometry);
        }
        gpu.queue().submit(std::iter::once(encoder.finish()));

        Ok(FilteredImage {
            gpu: gpu.clone(),
            texture: Arc::clone(&textures.output),
        })
    }
}

/// Particles drawn over a camera frame, each tinted by the pixel under it
///
/// The particle buffer is bound twice, as the kernel's read side and write
/// side. With a generator source the camera is dropped and particles keep
/// their class colors.
pub struct ParticleCamFilter {
    particles: ParticleBuffer,
    source: FilterSource,
}

impl ParticleCamFilter {
    pub const DRAG: &'static str = "drag";
    pub const COLOR: &'static str = "color";

    pub fn camera(particles: ParticleBuffer) -> Self {
        Self {
            particles,
            source: FilterSource::Image,
        }
    }

    pub fn generator(particles: ParticleBuffer, width: u32, height: u32) -> Self {
        Self {
            particles,
            source: FilterSource::Generator { width, height },
        }
    }

    /// A uniformly seeded particle region over `width` x `height`
    pub fn seed_particles(
        count: usize,
        width: u32,
        height: u32,
        seed: Option<u64>,
    ) -> Result<ParticleBuffer> {
        let mut particles = ParticleBuffer::allocate(count)?;
        ParticleInitializer::new(width, height).fill_seeded(
            &mut particles,
            Distribution::Uniform,
            false,
            seed,
        );
        Ok(particles)
    }

    pub fn particles(&self) -> &ParticleBuffer {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut ParticleBuffer {
        &mut self.particles
    }

    pub fn read_particles(&self, gpu: &GpuContext) -> Result<Vec<Particle>> {
        self.particles.read_back(gpu)
    }

    fn particle_bindings(&self) -> [u32; 2] {
        match self.source {
            FilterSource::Image => [2, 3],
            FilterSource::Generator { .. } => [1, 2],
        }
    }
}

impl FilterKernel for ParticleCamFilter {
    fn name(&self) -> &str {
        "particle cam"
    }

    fn program(&self) -> &str {
        match self.source {
            FilterSource::Image => shaders::PARTICLE_CAM,
            FilterSource::Generator { .. } => shaders::PARTICLE_FIELD,
        }
    }

    fn source(&self) -> FilterSource {
        self.source
    }

    fn parameters(&self) -> Vec<FilterParameterDescriptor> {
        let first = self.particle_bindings()[1] + 1;
        vec![
            FilterParameterDescriptor::scalar(Self::DRAG, first, 0.97),
            FilterParameterDescriptor::color(Self::COLOR, first + 1, ParticleColor::default()),
        ]
    }

    fn custom_bindings(&self) -> SmallVec<[u32; 4]> {
        SmallVec::from_slice(&self.particle_bindings())
    }

    fn prepare(&mut self, gpu: &GpuContext) -> Result<()> {
        self.particles.gpu_view(gpu);
        self.particles.sync(gpu.queue());
        Ok(())
    }

    fn custom_buffer(&self, binding: u32) -> Option<&wgpu::Buffer> {
        if !self.particle_bindings().contains(&binding) {
            return None;
        }
        self.particles.view().map(|view| view.buffer())
    }

    fn custom_geometry(&self, granularity: u32) -> Option<DispatchGeometry> {
        Some(DispatchGeometry::for_particles(self.particles.len(), granularity))
    }

    fn clear_on_step(&self) -> bool {
        true
    }
}

/// Per-pixel blend toward a tinted copy of the input
#[derive(Clone, Copy, Debug, Default)]
pub struct TintFilter;

impl TintFilter {
    pub const TINT: &'static str = "tint";
    pub const STRENGTH: &'static str = "strength";
}

impl FilterKernel for TintFilter {
    fn name(&self) -> &str {
        "tint"
    }

    fn program(&self) -> &str {
        shaders::TINT
    }

    fn source(&self) -> FilterSource {
        FilterSource::Image
    }

    fn parameters(&self) -> Vec<FilterParameterDescriptor> {
        vec![
            FilterParameterDescriptor::color(Self::TINT, 2, ParticleColor::new(1.0, 0.8, 0.6, 1.0)),
            FilterParameterDescriptor::scalar(Self::STRENGTH, 3, 1.0),
        ]
    }
}
