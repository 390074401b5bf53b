//! Compute pipelines and dispatch geometry

use std::collections::HashMap;

use crate::device::GpuContext;
use crate::error::{ParticleLabError, Result};
use crate::shaders::{KernelShape, ShaderLibrary, IMAGE_TILE};

/// Thread-group and grid sizes for one dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchGeometry {
    pub threads_per_group: [u32; 3],
    pub groups_per_grid: [u32; 3],
}

/// Groups per grid axis; the device is requested with the default limit
pub const MAX_GROUPS_PER_DIMENSION: u32 = 65535;

impl DispatchGeometry {
    /// One thread per particle, `granularity` threads per group
    ///
    /// The grid is `count / granularity` groups, so when `granularity` does
    /// not divide `count` the trailing particles are never dispatched. Grids
    /// wider than [`MAX_GROUPS_PER_DIMENSION`] fold onto the y axis; kernels
    /// linearize as `id.x + id.y * num_workgroups.x * WORKGROUP_SIZE`.
    pub fn for_particles(count: usize, granularity: u32) -> Self {
        Self::for_particles_within(count, granularity, MAX_GROUPS_PER_DIMENSION)
    }

    /// `for_particles` against an explicit per-axis group limit
    pub fn for_particles_within(count: usize, granularity: u32, limit: u32) -> Self {
        let granularity = granularity.max(1);
        let limit = limit.max(1) as usize;
        let groups = count / granularity as usize;
        let (x, y) = if groups <= limit {
            (groups, 1)
        } else {
            (limit, groups.div_ceil(limit).min(limit))
        };
        Self {
            threads_per_group: [granularity, 1, 1],
            groups_per_grid: [x as u32, y as u32, 1],
        }
    }

    /// Particle index of a thread, as the 1-D kernels compute it
    pub fn linear_index(&self, global_id: [u32; 2]) -> u64 {
        global_id[0] as u64
            + global_id[1] as u64 * self.groups_per_grid[0] as u64 * self.threads_per_group[0] as u64
    }

    /// One thread per pixel in square tiles; the grid rounds up
    pub fn for_image(width: u32, height: u32) -> Self {
        Self {
            threads_per_group: [IMAGE_TILE, IMAGE_TILE, 1],
            groups_per_grid: [width.div_ceil(IMAGE_TILE), height.div_ceil(IMAGE_TILE), 1],
        }
    }

    /// Total threads launched
    pub fn threads(&self) -> u64 {
        (0..3)
            .map(|axis| self.threads_per_group[axis] as u64 * self.groups_per_grid[axis] as u64)
            .product()
    }

    /// Work items a 1-D dispatch of this geometry never reaches
    pub fn uncovered_items(&self, count: usize) -> usize {
        count.saturating_sub(self.threads().min(usize::MAX as u64) as usize)
    }

    pub fn dispatch(&self, pass: &mut wgpu::ComputePass<'_>) {
        let [x, y, z] = self.groups_per_grid;
        pass.dispatch_workgroups(x, y, z);
    }
}

/// A compiled compute program with its bind group layout
pub struct ComputeKernelPipeline {
    program: String,
    shape: KernelShape,
    granularity: u32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl ComputeKernelPipeline {
    /// Compile `program` from `library` against a single bind group
    ///
    /// A program missing from `library` is a compilation error like any other.
    /// `granularity` becomes the 1-D thread-group width; `constants` are
    /// forwarded as WGSL `override` values. Compilation or validation errors
    /// are captured in an error scope and returned instead of panicking.
    pub fn build(
        gpu: &GpuContext,
        library: &ShaderLibrary,
        program: &str,
        layout_entries: &[wgpu::BindGroupLayoutEntry],
        granularity: u32,
        constants: &HashMap<String, f64>,
    ) -> Result<Self> {
        let shader = library
            .get(program)
            .map_err(|e| ParticleLabError::Compilation {
                program: program.to_string(),
                message: format!("not in shader library ({e})"),
            })?;
        let source = shader.source_for(granularity);
        let device = gpu.device();

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program),
            entries: layout_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(program),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants,
                zero_initialize_workgroup_memory: false,
            },
            cache: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ParticleLabError::Compilation {
                program: program.to_string(),
                message: error.to_string(),
            });
        }

        tracing::debug!(
            "Built compute pipeline '{}' ({:?}, granularity {})",
            program,
            shader.shape,
            granularity
        );

        Ok(Self {
            program: program.to_string(),
            shape: shader.shape,
            granularity,
            layout,
            pipeline,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn shape(&self) -> KernelShape {
        self.shape
    }

    /// Thread-group width the program was built with
    pub fn thread_execution_granularity(&self) -> u32 {
        self.granularity
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn bind_group(&self, gpu: &GpuContext, entries: &[wgpu::BindGroupEntry<'_>]) -> wgpu::BindGroup {
        gpu.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&self.program),
            layout: &self.layout,
            entries,
        })
    }

    /// Record a dispatch into an open compute pass
    pub fn dispatch(
        &self,
        pass: &mut wgpu::ComputePass<'_>,
        bind_group: &wgpu::BindGroup,
        geometry: &DispatchGeometry,
    ) {
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        geometry.dispatch(pass);
    }
}

/// Bind group layout entry helpers
pub mod layout {
    pub fn storage_buffer(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    pub fn uniform_buffer(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    pub fn sampled_texture(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }
    }

    pub fn storage_texture(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: crate::target::TARGET_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticleCount;
    use crate::device::vendor_granularity;

    #[test]
    fn test_supported_counts_divide_evenly() {
        for count in ParticleCount::ALL {
            let len = count.get();
            for shift in 0..=18 {
                let granularity = 1u32 << shift;
                let geometry = DispatchGeometry::for_particles(len, granularity);
                assert_eq!(geometry.uncovered_items(len), 0, "{count:?} / {granularity}");
                assert!(geometry.threads() >= len as u64);
            }
            assert_eq!(len % 32, 0);
        }
    }

    #[test]
    fn test_supported_counts_fit_device_limit() {
        let limit = wgpu::Limits::default().max_compute_workgroups_per_dimension;
        assert_eq!(limit, MAX_GROUPS_PER_DIMENSION);

        for count in ParticleCount::ALL {
            for vendor in [0x10DE, 0x1002, 0x8086, 0x106B, 0x13B5, 0] {
                let granularity = vendor_granularity(vendor);
                let geometry = DispatchGeometry::for_particles(count.get(), granularity);
                assert!(
                    geometry.groups_per_grid.iter().all(|&groups| groups <= limit),
                    "{count:?} at {granularity}: {:?}",
                    geometry.groups_per_grid
                );
                assert_eq!(geometry.uncovered_items(count.get()), 0);
            }
        }
    }

    #[test]
    fn test_folded_grid_reaches_every_particle_once() {
        // 1000 groups of 4 folded under a limit of 300 groups per axis
        let geometry = DispatchGeometry::for_particles_within(4000, 4, 300);
        assert_eq!(geometry.groups_per_grid, [300, 4, 1]);

        let width = 300 * 4;
        let mut hits = vec![0u32; 4000];
        for y in 0..geometry.groups_per_grid[1] {
            for x in 0..width {
                let index = geometry.linear_index([x, y]) as usize;
                if index < hits.len() {
                    hits[index] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_large_counts_fold() {
        let geometry = DispatchGeometry::for_particles(1 << 22, 16);
        assert_eq!(geometry.groups_per_grid, [65535, 5, 1]);
        assert_eq!(geometry.uncovered_items(1 << 22), 0);
    }

    #[test]
    fn test_remainder_is_reported() {
        let geometry = DispatchGeometry::for_particles(1000, 64);
        assert_eq!(geometry.groups_per_grid, [15, 1, 1]);
        assert_eq!(geometry.uncovered_items(1000), 40);
    }

    #[test]
    fn test_particle_geometry() {
        let geometry = DispatchGeometry::for_particles(1 << 20, 32);
        assert_eq!(geometry.threads_per_group, [32, 1, 1]);
        assert_eq!(geometry.groups_per_grid, [32768, 1, 1]);
    }

    #[test]
    fn test_image_geometry_rounds_up() {
        let geometry = DispatchGeometry::for_image(1280, 720);
        assert_eq!(geometry.threads_per_group, [16, 16, 1]);
        assert_eq!(geometry.groups_per_grid, [80, 45, 1]);

        let geometry = DispatchGeometry::for_image(17, 1);
        assert_eq!(geometry.groups_per_grid, [2, 1, 1]);
        assert!(geometry.threads() >= 17);
    }
}
