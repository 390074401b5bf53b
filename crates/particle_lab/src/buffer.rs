//! Particle storage shared between host and GPU
//!
//! # Architecture
//!
//! ```text
//! ParticleBuffer (owner)
//!        │
//!        ├── host region    16 KiB aligned, written by the initializer
//!        │
//!        └── GpuParticleView (borrowed, at most one per allocation)
//!            └── wgpu::Buffer imported from the host region
//! ```
//!
//! wgpu cannot wrap a foreign host pointer, so the import maps a storage
//! buffer at creation and fills it straight from the host region. After the
//! import the device copy is the live simulation state. The host region is
//! only written again by re-seeding, which bumps the generation; `sync`
//! re-imports on the queue so the new contents land between two frames.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use bytemuck::{Pod, Zeroable};

use crate::device::GpuContext;
use crate::error::{ParticleLabError, Result};
use crate::target::read_buffer;

/// Alignment of the host region (page-aligned for every supported platform)
pub const IMPORT_ALIGNMENT: usize = 0x4000;

/// One particle record
///
/// Kinematic particles use (x, y) for position and (z, w) for velocity.
/// Gravity wells use (x, y) for position, z for mass and w for spin.
/// Must match the WGSL struct layout exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Particle {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn position(&self) -> [f32; 2] {
        [self.x, self.y]
    }

    pub fn velocity(&self) -> [f32; 2] {
        [self.z, self.w]
    }

    /// Gravity-well mass
    pub fn mass(&self) -> f32 {
        self.z
    }

    /// Gravity-well spin
    pub fn spin(&self) -> f32 {
        self.w
    }
}

/// Non-owning GPU handle over a [`ParticleBuffer`]
pub struct GpuParticleView {
    buffer: wgpu::Buffer,
    len: usize,
}

impl GpuParticleView {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }
}

/// Fixed-size, page-aligned particle region
pub struct ParticleBuffer {
    ptr: NonNull<Particle>,
    len: usize,
    layout: Layout,
    generation: u64,
    imported_generation: u64,
    imports: u32,
    view: Option<GpuParticleView>,
}

// The region is plain memory owned exclusively by this value.
unsafe impl Send for ParticleBuffer {}
unsafe impl Sync for ParticleBuffer {}

impl ParticleBuffer {
    /// Allocate a zeroed region for `len` particles
    pub fn allocate(len: usize) -> Result<Self> {
        let particle_size = std::mem::size_of::<Particle>();
        let bytes = len.checked_mul(particle_size).filter(|&b| b > 0).ok_or(
            ParticleLabError::Allocation {
                bytes: len.saturating_mul(particle_size),
                align: IMPORT_ALIGNMENT,
            },
        )?;
        let layout = Layout::from_size_align(bytes, IMPORT_ALIGNMENT).map_err(|_| {
            ParticleLabError::Allocation {
                bytes,
                align: IMPORT_ALIGNMENT,
            }
        })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<Particle>()).ok_or(ParticleLabError::Allocation {
            bytes,
            align: IMPORT_ALIGNMENT,
        })?;

        tracing::debug!("Allocated particle region: {} particles, {} bytes", len, bytes);

        Ok(Self {
            ptr,
            len,
            layout,
            generation: 0,
            imported_generation: 0,
            imports: 0,
            view: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.layout.size()
    }

    /// Address of the host region (for alignment checks)
    pub fn as_ptr(&self) -> *const Particle {
        self.ptr.as_ptr()
    }

    /// Host-side contents as last written by the initializer
    pub fn particles(&self) -> &[Particle] {
        // SAFETY: ptr is valid for len particles for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Overwrite host contents; takes effect on the GPU at the next `sync`
    pub fn write<F>(&mut self, f: F)
    where
        F: FnOnce(&mut [Particle]),
    {
        // SAFETY: exclusive borrow of self, ptr valid for len particles.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        f(slice);
        self.generation += 1;
    }

    /// Number of host writes so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of times the region was imported into a device (0 or 1)
    pub fn import_count(&self) -> u32 {
        self.imports
    }

    /// Whether host contents are newer than the device copy
    pub fn is_dirty(&self) -> bool {
        self.view.is_some() && self.generation != self.imported_generation
    }

    /// The GPU view of this region, importing it on first use
    pub fn gpu_view(&mut self, gpu: &GpuContext) -> &GpuParticleView {
        if self.view.is_none() {
            self.imports += 1;
            self.imported_generation = self.generation;
        }
        // SAFETY: ptr is valid for len particles; the slice is only read here.
        let contents: &[Particle] = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        self.view.get_or_insert_with(|| import_region(gpu, contents))
    }

    /// The view, if the region has been imported
    pub fn view(&self) -> Option<&GpuParticleView> {
        self.view.as_ref()
    }

    /// Push host contents to the device if they changed since the last import
    ///
    /// The write is ordered on the queue, so it lands after every dispatch
    /// already submitted and before every dispatch submitted afterwards.
    pub fn sync(&mut self, queue: &wgpu::Queue) -> bool {
        let Some(view) = &self.view else {
            return false;
        };
        if self.generation == self.imported_generation {
            return false;
        }
        queue.write_buffer(&view.buffer, 0, bytemuck::cast_slice(self.particles()));
        self.imported_generation = self.generation;
        true
    }

    /// Copy the live device contents back to the host (blocking)
    pub fn read_back(&self, gpu: &GpuContext) -> Result<Vec<Particle>> {
        let view = self
            .view
            .as_ref()
            .ok_or_else(|| ParticleLabError::Readback("particle region not imported".into()))?;
        let bytes = read_buffer(gpu, &view.buffer, self.byte_len() as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

fn import_region(gpu: &GpuContext, contents: &[Particle]) -> GpuParticleView {
    let bytes: &[u8] = bytemuck::cast_slice(contents);
    let buffer = gpu.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Particle Buffer"),
        size: bytes.len() as u64,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: true,
    });
    buffer
        .slice(..)
        .get_mapped_range_mut()
        .copy_from_slice(bytes);
    buffer.unmap();

    tracing::debug!("Imported particle region into device ({} particles)", contents.len());

    GpuParticleView {
        buffer,
        len: contents.len(),
    }
}

impl Drop for ParticleBuffer {
    fn drop(&mut self) {
        // wgpu keeps the device buffer alive until submitted work using it completes.
        self.view = None;
        // SAFETY: ptr was allocated with this layout in `allocate`.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticleCount;

    #[test]
    fn test_allocation_is_import_aligned() {
        let buffer = ParticleBuffer::allocate(ParticleCount::QuarterMillion.get()).unwrap();
        assert_eq!(buffer.as_ptr() as usize % IMPORT_ALIGNMENT, 0);
        assert_eq!(buffer.byte_len(), (1 << 18) * 16);
        assert!(buffer.particles().iter().all(|p| *p == Particle::default()));
    }

    #[test]
    fn test_zero_length_is_an_allocation_error() {
        let err = ParticleBuffer::allocate(0).err().unwrap();
        assert!(matches!(err, ParticleLabError::Allocation { bytes: 0, .. }));
    }

    #[test]
    fn test_overflowing_length_is_an_allocation_error() {
        assert!(matches!(
            ParticleBuffer::allocate(usize::MAX / 2),
            Err(ParticleLabError::Allocation { .. })
        ));
    }

    #[test]
    fn test_write_bumps_generation() {
        let mut buffer = ParticleBuffer::allocate(8).unwrap();
        assert_eq!(buffer.generation(), 0);
        buffer.write(|particles| particles[3] = Particle::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(buffer.generation(), 1);
        assert_eq!(buffer.particles()[3].position(), [1.0, 2.0]);
        assert_eq!(buffer.particles()[3].velocity(), [3.0, 4.0]);
        // Nothing imported yet, so nothing is pending for the device
        assert!(!buffer.is_dirty());
        assert_eq!(buffer.import_count(), 0);
    }

    #[test]
    fn test_particle_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<Particle>(), 16);
        assert_eq!(std::mem::align_of::<Particle>(), 4);
    }
}
