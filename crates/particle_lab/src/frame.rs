//! Per-frame orchestration
//!
//! One `step` runs one frame through a fixed sequence:
//!
//! ```text
//! Idle ──acquire target──▶ Encoding ──submit──▶ Dispatched ──present──▶ Presented ──▶ Idle
//!   ▲                          │
//!   └──── no surface / no input (frame dropped)
//! ```
//!
//! Encoding syncs a re-seeded particle region, optionally zeroes the render
//! target, then records the particle kernel and (if configured) the darken
//! kernel into one compute pass. Everything goes out in a single submission.
//! Completion is observed through `Queue::on_submitted_work_done`, pumped by a
//! non-blocking poll at the start of the next frame; the callback forwards
//! notifications to the event dispatcher thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::RgbaImage;

use crate::buffer::{Particle, ParticleBuffer};
use crate::cache::TextureCache;
use crate::config::{Distribution, ParticleColor, SimulationConfig};
use crate::device::GpuContext;
use crate::error::{ParticleLabError, Result};
use crate::initializer::ParticleInitializer;
use crate::input::ImageInbox;
use crate::observer::{EventDispatcher, FrameEvent, FrameObserver};
use crate::pipeline::{layout, ComputeKernelPipeline, DispatchGeometry};
use crate::reference::{DarkenUniforms, SimulationUniforms};
use crate::shaders::{self, ShaderLibrary, PRESENT_SHADER};
use crate::stats::FrameStatistics;
use crate::target::{self, Extent, RenderTarget, ZeroFill};

/// Where the driver is within the current frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Encoding,
    Dispatched,
    Presented,
}

/// Why a frame was skipped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The surface had no texture to render into
    NoSurface,
    /// The configuration requires an external image and none has arrived
    MissingInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Dropped(DropReason),
}

/// Drives the particle simulation one frame at a time
pub struct FrameDriver {
    gpu: GpuContext,
    config: SimulationConfig,
    target: RenderTarget,
    extent: Extent,

    particles: ParticleBuffer,
    initializer: ParticleInitializer,
    granularity: u32,
    geometry: DispatchGeometry,

    update: ComputeKernelPipeline,
    darken: ComputeKernelPipeline,
    presenter: Option<Presenter>,

    trails: [wgpu::Texture; 2],
    current: usize,
    displayed: usize,
    zero_fill: ZeroFill,
    simulation_uniforms: wgpu::Buffer,
    darken_uniforms: wgpu::Buffer,

    inbox: ImageInbox,
    input: TextureCache<wgpu::Texture>,
    placeholder: wgpu::Texture,

    frame: u32,
    phase: FramePhase,
    statistics: Arc<Mutex<FrameStatistics>>,
    completed: Arc<AtomicU64>,
    events: EventDispatcher,
}

impl FrameDriver {
    /// Build a driver on an existing context with the built-in programs
    pub fn new(
        gpu: GpuContext,
        config: SimulationConfig,
        target: RenderTarget,
        observer: Box<dyn FrameObserver>,
    ) -> Result<Self> {
        Self::with_library(gpu, config, target, observer, &ShaderLibrary::builtin())
    }

    /// Build a driver whose programs are resolved from `library`
    pub fn with_library(
        gpu: GpuContext,
        config: SimulationConfig,
        target: RenderTarget,
        observer: Box<dyn FrameObserver>,
        library: &ShaderLibrary,
    ) -> Result<Self> {
        let events = EventDispatcher::spawn(observer);
        Self::assemble(gpu, config, target, events, library)
    }

    /// Acquire a device and build an offscreen driver
    ///
    /// A missing device is reported to `observer` before the error returns.
    pub fn headless(config: SimulationConfig, observer: Box<dyn FrameObserver>) -> Result<Self> {
        let events = EventDispatcher::spawn(observer);
        match GpuContext::new() {
            Ok(gpu) => Self::assemble(
                gpu,
                config,
                RenderTarget::Offscreen,
                events,
                &ShaderLibrary::builtin(),
            ),
            Err(e) => {
                tracing::error!("Cannot start simulation: {}", e);
                events.publish(FrameEvent::DeviceUnavailable(e.to_string()));
                Err(e)
            }
        }
    }

    fn assemble(
        gpu: GpuContext,
        config: SimulationConfig,
        target: RenderTarget,
        events: EventDispatcher,
        library: &ShaderLibrary,
    ) -> Result<Self> {
        config.validate()?;

        let count = config.particle_count.get();
        let granularity = gpu.execution_granularity(config.execution_granularity);
        let geometry = DispatchGeometry::for_particles(count, granularity);
        let uncovered = geometry.uncovered_items(count);
        if uncovered > 0 {
            tracing::warn!(
                "{} trailing particles are never dispatched with granularity {}",
                uncovered,
                granularity
            );
        }

        let mut particles = ParticleBuffer::allocate(count)?;
        let initializer = ParticleInitializer::new(config.width, config.height);
        initializer.fill_seeded(
            &mut particles,
            config.distribution,
            config.edges_only,
            config.seed,
        );
        particles.gpu_view(&gpu);

        let constants = HashMap::new();
        let update = ComputeKernelPipeline::build(
            &gpu,
            library,
            shaders::PARTICLE_UPDATE,
            &[
                layout::storage_buffer(0),
                layout::storage_texture(1),
                layout::uniform_buffer(2),
                layout::sampled_texture(3),
            ],
            granularity,
            &constants,
        )?;
        let darken = ComputeKernelPipeline::build(
            &gpu,
            library,
            shaders::DARKEN,
            &[
                layout::sampled_texture(0),
                layout::storage_texture(1),
                layout::uniform_buffer(2),
            ],
            granularity,
            &constants,
        )?;
        let presenter = match target.format() {
            Some(format) => Some(Presenter::new(&gpu, format)?),
            None => None,
        };

        let (width, height) = config.target_extent();
        let extent = Extent::new(width, height);
        let trails = [
            target::create_storage_texture(&gpu, extent, "Trail Texture A"),
            target::create_storage_texture(&gpu, extent, "Trail Texture B"),
        ];
        let zero_fill = ZeroFill::new(&gpu, extent);
        let simulation_uniforms = create_uniform_buffer(
            &gpu,
            "Simulation Uniforms",
            std::mem::size_of::<SimulationUniforms>(),
        );
        let darken_uniforms =
            create_uniform_buffer(&gpu, "Darken Uniforms", std::mem::size_of::<DarkenUniforms>());
        let placeholder = target::create_placeholder_texture(&gpu);

        tracing::info!(
            "Frame driver ready: {} particles, target {}x{}, granularity {} on {}",
            count,
            width,
            height,
            granularity,
            gpu.adapter_info()
        );

        Ok(Self {
            statistics: Arc::new(Mutex::new(FrameStatistics::new(count, Instant::now()))),
            completed: Arc::new(AtomicU64::new(0)),
            gpu,
            config,
            target,
            extent,
            particles,
            initializer,
            granularity,
            geometry,
            update,
            darken,
            presenter,
            trails,
            current: 0,
            displayed: 0,
            zero_fill,
            simulation_uniforms,
            darken_uniforms,
            inbox: ImageInbox::new(),
            input: TextureCache::new(),
            placeholder,
            frame: 0,
            phase: FramePhase::Idle,
            events,
        })
    }

    /// Run one frame
    pub fn step(&mut self) -> FrameOutcome {
        // Deliver completion callbacks of earlier frames
        self.gpu.poll();

        let surface_texture = match &self.target {
            RenderTarget::Offscreen => None,
            RenderTarget::Surface { surface, config } => match surface.get_current_texture() {
                Ok(texture) => Some(texture),
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    surface.configure(self.gpu.device(), config);
                    tracing::debug!("Surface outdated, reconfigured; dropping frame");
                    return FrameOutcome::Dropped(DropReason::NoSurface);
                }
                Err(e) => {
                    tracing::warn!("Surface error: {:?}", e);
                    return FrameOutcome::Dropped(DropReason::NoSurface);
                }
            },
        };
        self.phase = FramePhase::Encoding;

        if let Some(image) = self.inbox.take() {
            self.upload_input(&image);
        }
        if self.config.require_input_image && self.input.get().is_none() {
            tracing::debug!("No input image yet, dropping frame {}", self.frame);
            self.phase = FramePhase::Idle;
            return FrameOutcome::Dropped(DropReason::MissingInput);
        }

        let queue = self.gpu.queue();
        if self.particles.sync(queue) {
            tracing::debug!("Re-seeded particles synced at frame {}", self.frame);
        }

        let uniforms = SimulationUniforms::new(
            self.config.particle_color,
            (self.extent.width, self.extent.height),
            self.config.drag_factor,
            self.config.respawn_out_of_bounds,
            self.frame,
            self.input.get().is_some(),
        );
        queue.write_buffer(&self.simulation_uniforms, 0, bytemuck::bytes_of(&uniforms));
        let decay = self.config.darken_decay;
        if let Some(decay) = decay {
            queue.write_buffer(
                &self.darken_uniforms,
                0,
                bytemuck::bytes_of(&DarkenUniforms::new(decay)),
            );
        }

        let current = self.current;
        let next = 1 - current;
        let current_view = self.trails[current].create_view(&wgpu::TextureViewDescriptor::default());
        let input_view = self
            .input
            .get()
            .unwrap_or(&self.placeholder)
            .create_view(&wgpu::TextureViewDescriptor::default());

        let particle_view = self.particles.gpu_view(&self.gpu);
        let update_group = self.update.bind_group(
            &self.gpu,
            &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: particle_view.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&current_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.simulation_uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
            ],
        );
        let darken_group = decay.map(|_| {
            let next_view = self.trails[next].create_view(&wgpu::TextureViewDescriptor::default());
            self.darken.bind_group(
                &self.gpu,
                &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&current_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&next_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.darken_uniforms.as_entire_binding(),
                    },
                ],
            )
        });

        let mut encoder = self
            .gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        if self.config.clear_on_step {
            self.zero_fill.encode(&mut encoder, &self.trails[current]);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Particle Pass"),
                timestamp_writes: None,
            });
            self.update.dispatch(&mut pass, &update_group, &self.geometry);
            if let Some(group) = &darken_group {
                let geometry = DispatchGeometry::for_image(self.extent.width, self.extent.height);
                self.darken.dispatch(&mut pass, group, &geometry);
            }
        }

        if let (Some(presenter), Some(frame)) = (&self.presenter, &surface_texture) {
            let surface_view = frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            presenter.encode(&self.gpu, &mut encoder, &current_view, &surface_view);
        }

        self.gpu.queue().submit(std::iter::once(encoder.finish()));
        self.phase = FramePhase::Dispatched;
        self.notify_on_completion();

        if let Some(frame) = surface_texture {
            frame.present();
        }
        self.phase = FramePhase::Presented;

        self.displayed = current;
        if decay.is_some() {
            self.current = next;
        }
        self.frame = self.frame.wrapping_add(1);
        self.phase = FramePhase::Idle;
        FrameOutcome::Presented
    }

    fn notify_on_completion(&self) {
        let Some(sender) = self.events.sender() else {
            return;
        };
        let statistics = Arc::clone(&self.statistics);
        let completed = Arc::clone(&self.completed);

        self.gpu.queue().on_submitted_work_done(move || {
            completed.fetch_add(1, Ordering::Relaxed);
            sender.publish(FrameEvent::FrameUpdated);

            let report = match statistics.lock() {
                Ok(mut stats) => stats.record_frame(Instant::now()),
                Err(poisoned) => poisoned.into_inner().record_frame(Instant::now()),
            };
            if let Some(report) = report {
                tracing::info!("{}", report.label);
                sender.publish(FrameEvent::Statistics {
                    fps: report.fps,
                    label: report.label,
                });
            }
        });
    }

    fn upload_input(&mut self, image: &RgbaImage) {
        if image.width() == 0 || image.height() == 0 {
            tracing::warn!("Ignoring empty input image");
            return;
        }
        let gpu = &self.gpu;
        let texture = self.input.get_or_create(Extent::of_image(image), |extent| {
            target::create_input_texture(gpu, extent, "Input Texture")
        });
        target::upload_image(gpu, texture, image);
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Index of the next frame to run
    pub fn frame_index(&self) -> u32 {
        self.frame
    }

    /// Frames whose GPU work has been observed complete
    pub fn completed_frames(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Thread-group width of the particle kernel
    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn geometry(&self) -> DispatchGeometry {
        self.geometry
    }

    pub fn particle_buffer(&self) -> &ParticleBuffer {
        &self.particles
    }

    /// Handle for submitting camera frames from any thread
    pub fn inbox(&self) -> ImageInbox {
        self.inbox.clone()
    }

    pub fn submit_image(&self, image: RgbaImage) {
        self.inbox.submit(image);
    }

    /// Texture holding the most recently rendered frame
    pub fn output_texture(&self) -> &wgpu::Texture {
        &self.trails[self.displayed]
    }

    pub fn set_particle_color(&mut self, color: ParticleColor) {
        self.config.particle_color = color;
    }

    pub fn set_drag_factor(&mut self, drag: f32) -> Result<()> {
        let mut config = self.config.clone();
        config.drag_factor = drag;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_respawn_out_of_bounds(&mut self, respawn: bool) {
        self.config.respawn_out_of_bounds = respawn;
    }

    /// Toggle clearing; rejected while a darken decay is configured
    pub fn set_clear_on_step(&mut self, clear: bool) -> Result<()> {
        if clear && self.config.darken_decay.is_some() {
            return Err(ParticleLabError::InvalidConfig(
                "clear_on_step and darken_decay are mutually exclusive".to_string(),
            ));
        }
        self.config.clear_on_step = clear;
        Ok(())
    }

    /// Re-seed every particle; takes effect at the start of the next frame
    pub fn reset_particles(&mut self, distribution: Distribution, edges_only: bool) {
        self.config.distribution = distribution;
        self.config.edges_only = edges_only;
        self.initializer.fill_seeded(
            &mut self.particles,
            distribution,
            edges_only,
            self.config.seed,
        );
    }

    /// Reconfigure the surface after a window resize
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        self.target.resize(&self.gpu, width, height);
    }

    /// Copy the live particle state back from the device (blocking)
    pub fn read_particles(&self) -> Result<Vec<Particle>> {
        self.particles.read_back(&self.gpu)
    }

    /// Copy the most recent frame back from the device (blocking)
    pub fn read_output(&self) -> Result<RgbaImage> {
        target::read_texture(&self.gpu, self.output_texture())
    }

    /// Block until all submitted frames complete and their events are queued
    pub fn wait_idle(&self) {
        self.gpu.wait_idle();
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        // Let pending completion callbacks publish before the dispatcher stops
        self.gpu.wait_idle();
    }
}

fn create_uniform_buffer(gpu: &GpuContext, label: &str, size: usize) -> wgpu::Buffer {
    gpu.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Fullscreen blit from the render target to the surface
struct Presenter {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

impl Presenter {
    fn new(gpu: &GpuContext, format: wgpu::TextureFormat) -> Result<Self> {
        let device = gpu.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Present Shader"),
            source: wgpu::ShaderSource::Wgsl(PRESENT_SHADER.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Present Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Present Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Present Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ParticleLabError::Compilation {
                program: "present".to_string(),
                message: error.to_string(),
            });
        }

        Ok(Self {
            pipeline,
            layout,
            sampler,
        })
    }

    fn encode(
        &self,
        gpu: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::TextureView,
        target: &wgpu::TextureView,
    ) {
        let bind_group = gpu.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Present Bind Group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Present Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}
