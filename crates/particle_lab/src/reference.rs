//! CPU model of the WGSL kernels
//!
//! Everything here performs the same f32 and u32 operations in the same order
//! as `shaders.rs`, so a particle stepped here lands on the same bits as one
//! stepped on the device. Tests use it to check kernel properties without an
//! adapter, and as a parity oracle when one exists.

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::buffer::Particle;
use crate::config::ParticleColor;
use crate::pipeline::DispatchGeometry;

/// Uniform block of the `particle_update` kernel
///
/// Must match `SimulationParams` in the WGSL source (48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SimulationUniforms {
    pub color: [f32; 4],
    /// Render-target extent in pixels
    pub extent: [f32; 2],
    pub drag: f32,
    pub respawn: u32,
    pub frame: u32,
    pub has_input: u32,
    pub _pad: [u32; 2],
}

impl SimulationUniforms {
    pub fn new(
        color: ParticleColor,
        extent: (u32, u32),
        drag: f32,
        respawn: bool,
        frame: u32,
        has_input: bool,
    ) -> Self {
        Self {
            color: color.to_array(),
            extent: [extent.0 as f32, extent.1 as f32],
            drag,
            respawn: u32::from(respawn),
            frame,
            has_input: u32::from(has_input),
            _pad: [0; 2],
        }
    }
}

/// Uniform block of the `darken` kernel
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DarkenUniforms {
    pub decay: f32,
    pub _pad: [f32; 3],
}

impl DarkenUniforms {
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            _pad: [0.0; 3],
        }
    }
}

/// PCG-style integer hash
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Map a hash to [0, 1) using its top 24 bits
pub fn rand01(hash: u32) -> f32 {
    (hash >> 8) as f32 / 16_777_216.0
}

/// Base color permuted by particle class (index mod 3)
pub fn class_color(index: u32, color: [f32; 4]) -> [f32; 4] {
    let [r, g, b, a] = color;
    match index % 3 {
        0 => [r, g, b, a],
        1 => [b, r, g, a],
        _ => [g, b, r, a],
    }
}

/// Integrate one particle in place; returns whether it was respawned
pub fn step_particle(particle: &mut Particle, index: u32, uniforms: &SimulationUniforms) -> bool {
    particle.x += particle.z;
    particle.y += particle.w;
    particle.z *= uniforms.drag;
    particle.w *= uniforms.drag;

    let [width, height] = uniforms.extent;
    let outside =
        particle.x < 0.0 || particle.x >= width || particle.y < 0.0 || particle.y >= height;
    if !(outside && uniforms.respawn != 0) {
        return false;
    }

    let mut seed = pcg_hash(index ^ pcg_hash(uniforms.frame));
    particle.x = rand01(seed) * (width - 1.0);
    seed = pcg_hash(seed);
    particle.y = rand01(seed) * (height - 1.0);
    seed = pcg_hash(seed);
    particle.z = rand01(seed) * 2.0 - 1.0;
    seed = pcg_hash(seed);
    particle.w = rand01(seed) * 2.0 - 1.0;
    true
}

/// Pixel a particle lands on, if it is inside the target
pub fn pixel_coord(particle: &Particle, extent: [f32; 2]) -> Option<(u32, u32)> {
    let x = (particle.x + 0.5).floor();
    let y = (particle.y + 0.5).floor();
    if x < 0.0 || y < 0.0 || x >= extent[0] || y >= extent[1] {
        return None;
    }
    Some((x as u32, y as u32))
}

/// Sample an external image at a target pixel, scaled to the image's extent
///
/// An empty image samples as white, like the unbound placeholder.
pub fn sample_input(input: &RgbaImage, coord: (u32, u32), extent: [f32; 2]) -> [f32; 4] {
    let (iw, ih) = input.dimensions();
    if iw == 0 || ih == 0 {
        return [1.0; 4];
    }
    let sx = ((coord.0 as f32 * iw as f32 / extent[0]) as u32).min(iw - 1);
    let sy = ((coord.1 as f32 * ih as f32 / extent[1]) as u32).min(ih - 1);
    input.get_pixel(sx, sy).0.map(|c| c as f32 / 255.0)
}

/// Fade one pixel; alpha is kept
pub fn darken_pixel(pixel: [f32; 4], decay: f32) -> [f32; 4] {
    [pixel[0] * decay, pixel[1] * decay, pixel[2] * decay, pixel[3]]
}

/// Float render target for the CPU kernels
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceTarget {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl ReferenceTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn clear(&mut self) {
        self.pixels.fill([0.0; 4]);
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[(y * self.width + x) as usize]
    }

    fn set(&mut self, x: u32, y: u32, value: [f32; 4]) {
        self.pixels[(y * self.width + x) as usize] = value;
    }

    /// Number of pixels with non-zero alpha
    pub fn covered(&self) -> usize {
        self.pixels.iter().filter(|p| p[3] > 0.0).count()
    }

    /// Quantise to RGBA8 the way an `rgba8unorm` store does
    pub fn to_image(&self) -> RgbaImage {
        let bytes = self
            .pixels
            .iter()
            .flat_map(|p| p.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        RgbaImage::from_raw(self.width, self.height, bytes)
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }
}

/// Run `particle_update` over `particles` with thread groups of `granularity`
///
/// Coverage follows the device grid from [`DispatchGeometry::for_particles`],
/// so particles the dispatch never reaches are left untouched.
pub fn dispatch_reference(
    particles: &mut [Particle],
    granularity: u32,
    uniforms: &SimulationUniforms,
    target: &mut ReferenceTarget,
    input: Option<&RgbaImage>,
) {
    let geometry = DispatchGeometry::for_particles(particles.len(), granularity);
    let covered = particles.len() - geometry.uncovered_items(particles.len());
    for (index, particle) in particles[..covered].iter_mut().enumerate() {
        let index = index as u32;
        step_particle(particle, index, uniforms);

        let Some(coord) = pixel_coord(particle, uniforms.extent) else {
            continue;
        };
        let mut color = class_color(index, uniforms.color);
        if let Some(image) = input.filter(|_| uniforms.has_input != 0) {
            let sample = sample_input(image, coord, uniforms.extent);
            for (c, s) in color.iter_mut().zip(sample) {
                *c *= s;
            }
        }
        target.set(coord.0, coord.1, color);
    }
}

/// Run `darken` over the whole target
pub fn darken_reference(target: &mut ReferenceTarget, decay: f32) {
    for pixel in target.pixels.iter_mut() {
        *pixel = darken_pixel(*pixel, decay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniforms(drag: f32, respawn: bool) -> SimulationUniforms {
        SimulationUniforms::new(ParticleColor::default(), (100, 50), drag, respawn, 0, false)
    }

    #[test]
    fn test_uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<SimulationUniforms>(), 48);
        assert_eq!(std::mem::size_of::<DarkenUniforms>(), 16);
    }

    #[test]
    fn test_pcg_hash_known_values() {
        // Reference values from the 32-bit PCG RXS-M-XS permutation
        assert_eq!(pcg_hash(0), 129_708_002);
        assert_ne!(pcg_hash(1), pcg_hash(2));
        assert!((0.0..1.0).contains(&rand01(u32::MAX)));
        assert_eq!(rand01(0), 0.0);
    }

    #[test]
    fn test_drag_decays_velocity_geometrically() {
        let drag = 0.9;
        let params = uniforms(drag, false);
        let mut particle = Particle::new(50.0, 25.0, 0.5, -0.25);

        let mut expected = [0.5f32, -0.25];
        for _ in 0..20 {
            step_particle(&mut particle, 0, &params);
            expected = expected.map(|v| v * drag);
        }
        assert_eq!(particle.velocity(), expected);
        assert!((particle.z - 0.5 * drag.powi(20)).abs() < 1e-6);
    }

    #[test]
    fn test_unit_drag_keeps_velocity() {
        let params = uniforms(1.0, false);
        let mut particle = Particle::new(10.0, 10.0, 1.0, 0.5);
        for _ in 0..5 {
            step_particle(&mut particle, 0, &params);
        }
        assert_eq!(particle, Particle::new(15.0, 12.5, 1.0, 0.5));
    }

    #[test]
    fn test_respawn_brings_particle_back() {
        let params = uniforms(1.0, true);
        let mut particle = Particle::new(99.5, 10.0, 1.0, 0.0);
        assert!(step_particle(&mut particle, 7, &params));
        assert!((0.0..99.0).contains(&particle.x));
        assert!((0.0..49.0).contains(&particle.y));
        assert!((-1.0..1.0).contains(&particle.z));
        assert!((-1.0..1.0).contains(&particle.w));
    }

    #[test]
    fn test_without_respawn_particles_run_free() {
        let params = uniforms(1.0, false);
        let mut particle = Particle::new(99.5, 10.0, 1.0, 0.0);
        for _ in 0..10 {
            assert!(!step_particle(&mut particle, 7, &params));
        }
        assert_eq!(particle.x, 109.5);

        let mut target = ReferenceTarget::new(100, 50);
        dispatch_reference(std::slice::from_mut(&mut particle), 1, &params, &mut target, None);
        assert_eq!(target.covered(), 0);
    }

    #[test]
    fn test_respawn_depends_on_frame_and_index() {
        let start = Particle::new(-1.0, -1.0, -1.0, -1.0);
        let spawn = |index, frame| {
            let mut p = start;
            let mut params = uniforms(1.0, true);
            params.frame = frame;
            step_particle(&mut p, index, &params);
            p
        };
        assert_eq!(spawn(3, 9), spawn(3, 9));
        assert_ne!(spawn(3, 9), spawn(4, 9));
        assert_ne!(spawn(3, 9), spawn(3, 10));
    }

    #[test]
    fn test_color_classes_cycle_by_index() {
        let granularity = 32u32;
        let color = ParticleColor::new(0.8, 0.4, 0.2, 1.0);
        let params = SimulationUniforms::new(color, (256, 4), 1.0, false, 0, false);

        // One particle per pixel along the first row, at rest
        let mut particles: Vec<Particle> = (0..3 * granularity)
            .map(|i| Particle::new(i as f32, 0.0, 0.0, 0.0))
            .collect();
        let mut target = ReferenceTarget::new(256, 4);
        dispatch_reference(&mut particles, granularity, &params, &mut target, None);

        for i in 0..3 * granularity {
            let expected = match i % 3 {
                0 => [0.8, 0.4, 0.2, 1.0],
                1 => [0.2, 0.8, 0.4, 1.0],
                _ => [0.4, 0.2, 0.8, 1.0],
            };
            assert_eq!(target.pixel(i, 0), expected, "particle {i}");
        }
        assert_eq!(target.covered(), 3 * granularity as usize);
    }

    #[test]
    fn test_input_image_modulates_color() {
        let params = SimulationUniforms::new(ParticleColor::new(1.0, 1.0, 1.0, 1.0), (4, 4), 1.0, false, 0, true);
        let input = RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 51, 255]));
        let mut particles = [Particle::new(3.0, 3.0, 0.0, 0.0)];
        let mut target = ReferenceTarget::new(4, 4);
        dispatch_reference(&mut particles, 1, &params, &mut target, Some(&input));
        assert_eq!(target.pixel(3, 3), [1.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn test_trailing_particles_are_not_dispatched() {
        let params = uniforms(1.0, false);
        let mut particles = vec![Particle::new(1.0, 1.0, 1.0, 1.0); 40];
        let mut target = ReferenceTarget::new(100, 50);
        dispatch_reference(&mut particles, 32, &params, &mut target, None);

        assert!(particles[..32].iter().all(|p| p.x == 2.0));
        assert!(particles[32..].iter().all(|p| p.x == 1.0));
    }

    #[test]
    fn test_folded_dispatch_steps_every_particle() {
        // 2^20 particles in groups of 16 exceed one grid axis
        let len = 1 << 20;
        assert!(DispatchGeometry::for_particles(len, 16).groups_per_grid[1] > 1);

        let params = uniforms(1.0, false);
        let mut particles = vec![Particle::new(0.0, 0.0, 1.0, 0.0); len];
        let mut target = ReferenceTarget::new(100, 50);
        dispatch_reference(&mut particles, 16, &params, &mut target, None);
        assert!(particles.iter().all(|p| p.x == 1.0));
    }

    #[test]
    fn test_empty_input_samples_white() {
        let input = RgbaImage::new(0, 0);
        assert_eq!(sample_input(&input, (3, 3), [4.0, 4.0]), [1.0; 4]);
    }

    #[test]
    fn test_darken_keeps_alpha() {
        assert_eq!(darken_pixel([1.0, 0.5, 0.25, 1.0], 0.5), [0.5, 0.25, 0.125, 1.0]);

        let mut target = ReferenceTarget::new(2, 1);
        target.set(0, 0, [1.0, 1.0, 1.0, 1.0]);
        darken_reference(&mut target, 0.9);
        darken_reference(&mut target, 0.9);
        let faded = target.pixel(0, 0);
        assert!((faded[0] - 0.81).abs() < 1e-6);
        assert_eq!(faded[3], 1.0);
        assert_eq!(target.to_image().get_pixel(0, 0).0, [207, 207, 207, 255]);
    }
}
