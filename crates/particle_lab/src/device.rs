//! GPU context: adapter, device and queue
//!
//! A `GpuContext` is created once per simulation and shared (cheaply, via
//! `Arc`) with the frame driver and any filter bridges.

use std::fmt;
use std::sync::Arc;

use crate::error::{ParticleLabError, Result};

/// Thread-group width used when the vendor is not recognised
pub const DEFAULT_GRANULARITY: u32 = 64;

/// Adapter description kept for logging
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Shared wgpu handles
///
/// Field order matters: the instance is declared last so it outlives the
/// device and queue on drop.
#[derive(Clone)]
pub struct GpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter: Arc<wgpu::Adapter>,
    adapter_info: AdapterInfo,
    limits: wgpu::Limits,
    _instance: Arc<wgpu::Instance>,
}

impl GpuContext {
    /// Get the preferred backend for the current platform
    fn preferred_backends() -> wgpu::Backends {
        #[cfg(target_os = "macos")]
        {
            wgpu::Backends::METAL
        }
        #[cfg(target_os = "windows")]
        {
            wgpu::Backends::DX12
        }
        #[cfg(target_os = "linux")]
        {
            wgpu::Backends::VULKAN
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        {
            wgpu::Backends::PRIMARY
        }
    }

    fn create_instance() -> wgpu::Instance {
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: Self::preferred_backends(),
            ..Default::default()
        })
    }

    /// Create a context without a surface (headless compute and offscreen frames)
    pub fn new() -> Result<Self> {
        let instance = Self::create_instance();
        pollster::block_on(Self::from_instance(instance, None))
    }

    /// Create a context together with a presentable surface for `window`
    pub fn with_surface<W>(window: Arc<W>) -> Result<(Self, wgpu::Surface<'static>)>
    where
        W: wgpu::WindowHandle + 'static,
    {
        let instance = Self::create_instance();
        let surface = instance
            .create_surface(window)
            .map_err(|e| ParticleLabError::DeviceUnavailable(e.to_string()))?;
        let ctx = pollster::block_on(Self::from_instance(instance, Some(&surface)))?;
        Ok((ctx, surface))
    }

    async fn from_instance(
        instance: wgpu::Instance,
        surface: Option<&wgpu::Surface<'static>>,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                ParticleLabError::DeviceUnavailable("no suitable GPU adapter found".to_string())
            })?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name,
            vendor: raw_info.vendor,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        tracing::debug!("Selected adapter: {}", adapter_info);

        // Large render targets need the adapter's texture size, not the default 8192.
        let limits = wgpu::Limits::default().using_resolution(adapter.limits());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Particle Lab Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter: Arc::new(adapter),
            adapter_info,
            limits,
            _instance: Arc::new(instance),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter_info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Preferred thread-group width for 1-D kernels on this device
    ///
    /// `requested` wins when given; the result is always a power of two that
    /// fits the device's per-workgroup invocation limit.
    pub fn execution_granularity(&self, requested: Option<u32>) -> u32 {
        let preferred = requested.unwrap_or_else(|| vendor_granularity(self.adapter_info.vendor));
        clamp_granularity(preferred, self.limits.max_compute_invocations_per_workgroup)
    }

    /// Process completion callbacks without blocking
    pub fn poll(&self) {
        self.device.poll(wgpu::Maintain::Poll);
    }

    /// Block until all submitted work has finished
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

/// SIMD width by PCI vendor id
pub fn vendor_granularity(vendor: u32) -> u32 {
    match vendor {
        0x10DE => 32, // NVIDIA warp
        0x106B => 32, // Apple SIMD group
        0x1002 => 64, // AMD wavefront
        0x8086 => 16, // Intel EU SIMD16
        _ => DEFAULT_GRANULARITY,
    }
}

fn clamp_granularity(preferred: u32, max_invocations: u32) -> u32 {
    let max = if max_invocations == 0 {
        DEFAULT_GRANULARITY
    } else {
        // largest power of two not above the limit
        1 << (31 - max_invocations.leading_zeros())
    };
    preferred.max(1).next_power_of_two().min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_granularity() {
        assert_eq!(vendor_granularity(0x10DE), 32);
        assert_eq!(vendor_granularity(0x1002), 64);
        assert_eq!(vendor_granularity(0x8086), 16);
        assert_eq!(vendor_granularity(0xDEAD), DEFAULT_GRANULARITY);
    }

    #[test]
    fn test_clamp_granularity() {
        assert_eq!(clamp_granularity(32, 256), 32);
        assert_eq!(clamp_granularity(48, 256), 64);
        assert_eq!(clamp_granularity(1024, 256), 256);
        assert_eq!(clamp_granularity(512, 300), 256);
        assert_eq!(clamp_granularity(0, 256), 1);
        assert_eq!(clamp_granularity(128, 0), DEFAULT_GRANULARITY);
    }
}
