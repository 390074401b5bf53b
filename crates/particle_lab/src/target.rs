//! Render-target textures, zero fills and readback
//!
//! Every image the kernels write is `Rgba8Unorm` so it can be bound as a
//! write-only storage texture on all backends without extra features.

use image::RgbaImage;

use crate::device::GpuContext;
use crate::error::{ParticleLabError, Result};

/// Format of every kernel-written texture
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Width and height of a 2-D image in pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of_image(image: &RgbaImage) -> Self {
        Self::new(image.width(), image.height())
    }

    pub fn to_wgpu(self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

/// Where finished frames go
pub enum RenderTarget {
    /// Presented to a window surface every frame
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    /// Kept in the driver's output texture for readback or filtering
    Offscreen,
}

impl RenderTarget {
    /// Configure `surface` for presentation at `width` x `height`
    ///
    /// A non-sRGB format is preferred because the kernels write linear
    /// values that are meant to be shown as-is.
    pub fn surface(
        gpu: &GpuContext,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> Self {
        let caps = surface.get_capabilities(gpu.adapter());
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .unwrap_or(wgpu::TextureFormat::Bgra8Unorm);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: wgpu::CompositeAlphaMode::Opaque,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(gpu.device(), &config);
        tracing::debug!("Configured surface {}x{} as {:?}", config.width, config.height, format);

        RenderTarget::Surface { surface, config }
    }

    /// Reconfigure after a window resize; no-op offscreen
    pub fn resize(&mut self, gpu: &GpuContext, width: u32, height: u32) {
        if let RenderTarget::Surface { surface, config } = self {
            config.width = width.max(1);
            config.height = height.max(1);
            surface.configure(gpu.device(), config);
        }
    }

    pub fn is_surface(&self) -> bool {
        matches!(self, RenderTarget::Surface { .. })
    }

    /// Surface format, if presenting
    pub fn format(&self) -> Option<wgpu::TextureFormat> {
        match self {
            RenderTarget::Surface { config, .. } => Some(config.format),
            RenderTarget::Offscreen => None,
        }
    }
}

/// Bytes per row padded to wgpu's copy alignment
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// A texture the kernels can write and later stages can read or copy
pub fn create_storage_texture(gpu: &GpuContext, extent: Extent, label: &str) -> wgpu::Texture {
    gpu.device().create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent.to_wgpu(),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

/// A sampled texture that receives uploaded images
pub fn create_input_texture(gpu: &GpuContext, extent: Extent, label: &str) -> wgpu::Texture {
    gpu.device().create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent.to_wgpu(),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

/// Copy an RGBA8 image into a texture of the same extent
pub fn upload_image(gpu: &GpuContext, texture: &wgpu::Texture, image: &RgbaImage) {
    let extent = Extent::of_image(image);
    gpu.queue().write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.as_raw(),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(4 * extent.width),
            rows_per_image: Some(extent.height),
        },
        extent.to_wgpu(),
    );
}

/// A 1x1 opaque white texture, bound when no external image is present
pub fn create_placeholder_texture(gpu: &GpuContext) -> wgpu::Texture {
    let texture = create_input_texture(gpu, Extent::new(1, 1), "Placeholder Input Texture");
    upload_image(gpu, &texture, &RgbaImage::from_pixel(1, 1, image::Rgba([255; 4])));
    texture
}

/// A zero-filled buffer blitted over a target to clear it
///
/// wgpu zero-initialises new buffers, so the buffer never needs writing.
pub struct ZeroFill {
    buffer: wgpu::Buffer,
    extent: Extent,
}

impl ZeroFill {
    pub fn new(gpu: &GpuContext, extent: Extent) -> Self {
        let size = padded_bytes_per_row(extent.width) as u64 * extent.height as u64;
        let buffer = gpu.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Zero Fill Buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer, extent }
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Record a copy that zeroes `texture` (which must have this extent)
    pub fn encode(&self, encoder: &mut wgpu::CommandEncoder, texture: &wgpu::Texture) {
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &self.buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row(self.extent.width)),
                    rows_per_image: Some(self.extent.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            self.extent.to_wgpu(),
        );
    }
}

/// Map a buffer range after copying it into a staging buffer (blocking)
pub fn read_buffer(gpu: &GpuContext, source: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
    let staging = gpu.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Readback Buffer"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Buffer Readback Encoder"),
        });
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    gpu.queue().submit(std::iter::once(encoder.finish()));

    map_staging(gpu, &staging)
}

/// Read an `Rgba8Unorm` texture back into an image (blocking)
pub fn read_texture(gpu: &GpuContext, texture: &wgpu::Texture) -> Result<RgbaImage> {
    let extent = Extent::new(texture.width(), texture.height());
    let bytes_per_row = padded_bytes_per_row(extent.width);

    let staging = gpu.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Texture Readback Buffer"),
        size: bytes_per_row as u64 * extent.height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Texture Readback Encoder"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &staging,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(extent.height),
            },
        },
        extent.to_wgpu(),
    );
    gpu.queue().submit(std::iter::once(encoder.finish()));

    let data = map_staging(gpu, &staging)?;

    // Strip row padding
    let row_bytes = (extent.width * 4) as usize;
    let mut pixels = Vec::with_capacity(row_bytes * extent.height as usize);
    for row in data.chunks(bytes_per_row as usize).take(extent.height as usize) {
        pixels.extend_from_slice(&row[..row_bytes]);
    }

    RgbaImage::from_raw(extent.width, extent.height, pixels)
        .ok_or_else(|| ParticleLabError::Readback("texture size mismatch".to_string()))
}

fn map_staging(gpu: &GpuContext, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    gpu.wait_idle();

    rx.recv()
        .map_err(|e| ParticleLabError::Readback(e.to_string()))?
        .map_err(|e| ParticleLabError::Readback(e.to_string()))?;

    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(1280), 5120);
    }

    #[test]
    fn test_extent_of_image() {
        let image = RgbaImage::new(12, 7);
        assert_eq!(Extent::of_image(&image), Extent::new(12, 7));
        assert_eq!(Extent::new(12, 7).to_wgpu().depth_or_array_layers, 1);
    }
}
