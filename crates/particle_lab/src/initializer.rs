//! Seeding of particle positions and velocities

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{Particle, ParticleBuffer};
use crate::config::Distribution;

/// Fills a particle buffer over a `width` x `height` image
#[derive(Clone, Copy, Debug)]
pub struct ParticleInitializer {
    pub width: u32,
    pub height: u32,
}

impl ParticleInitializer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Overwrite every record in `buffer`
    ///
    /// Positions come from `mode` over [0, width) x [0, height). With
    /// `edges_only` one coordinate of each particle is pinned to one of the
    /// four edges, chosen uniformly. Velocities are uniform in [-1, 1].
    pub fn fill<R: Rng + ?Sized>(
        &self,
        buffer: &mut ParticleBuffer,
        mode: Distribution,
        edges_only: bool,
        rng: &mut R,
    ) {
        buffer.write(|particles| {
            for particle in particles.iter_mut() {
                *particle = self.sample(mode, edges_only, rng);
            }
        });
        tracing::debug!(
            "Seeded {} particles ({:?}, edges_only={})",
            buffer.len(),
            mode,
            edges_only
        );
    }

    /// `fill` with a reproducible generator when `seed` is given
    pub fn fill_seeded(
        &self,
        buffer: &mut ParticleBuffer,
        mode: Distribution,
        edges_only: bool,
        seed: Option<u64>,
    ) {
        match seed {
            Some(seed) => self.fill(buffer, mode, edges_only, &mut StdRng::seed_from_u64(seed)),
            None => self.fill(buffer, mode, edges_only, &mut rand::thread_rng()),
        }
    }

    fn sample<R: Rng + ?Sized>(&self, mode: Distribution, edges_only: bool, rng: &mut R) -> Particle {
        let width = self.width as f32;
        let height = self.height as f32;

        let mut x = sample_axis(mode, width, rng);
        let mut y = sample_axis(mode, height, rng);

        if edges_only {
            // The free coordinate stays off the edges so exactly one is pinned
            match rng.gen_range(0..4) {
                0 => (x, y) = (0.0, off_edge(y, mode, height, rng)),
                1 => (x, y) = (width, off_edge(y, mode, height, rng)),
                2 => (x, y) = (off_edge(x, mode, width, rng), 0.0),
                _ => (x, y) = (off_edge(x, mode, width, rng), height),
            }
        }

        let vx = rng.gen_range(-1.0..=1.0);
        let vy = rng.gen_range(-1.0..=1.0);
        Particle::new(x, y, vx, vy)
    }
}

/// Gaussian draws beyond this many standard deviations are redrawn
const GAUSSIAN_TRUNCATION: f32 = 3.0;

/// One coordinate in [0, extent); a degenerate axis yields 0
fn sample_axis<R: Rng + ?Sized>(mode: Distribution, extent: f32, rng: &mut R) -> f32 {
    if extent <= 0.0 {
        return 0.0;
    }
    match mode {
        Distribution::Uniform => rng.gen_range(0.0..extent),
        // Truncated at 3 sigma = half the extent; rounding at the bounds is redrawn too
        Distribution::Gaussian => loop {
            let z = standard_normal(rng);
            if z.abs() > GAUSSIAN_TRUNCATION {
                continue;
            }
            let value = extent * 0.5 + z * extent / 6.0;
            if (0.0..extent).contains(&value) {
                return value;
            }
        },
    }
}

fn off_edge<R: Rng + ?Sized>(mut value: f32, mode: Distribution, extent: f32, rng: &mut R) -> f32 {
    while value == 0.0 && extent > 0.0 {
        value = sample_axis(mode, extent, rng);
    }
    value
}

/// Box-Muller transform
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    // 1 - [0, 1) lies in (0, 1], so ln never sees zero
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 1 << 14;

    fn seeded(mode: Distribution, edges_only: bool, seed: u64) -> ParticleBuffer {
        let mut buffer = ParticleBuffer::allocate(LEN).unwrap();
        ParticleInitializer::new(640, 360).fill_seeded(&mut buffer, mode, edges_only, Some(seed));
        buffer
    }

    #[test]
    fn test_uniform_covers_image() {
        let buffer = seeded(Distribution::Uniform, false, 1);
        let particles = buffer.particles();

        assert!(particles
            .iter()
            .all(|p| (0.0..640.0).contains(&p.x) && (0.0..360.0).contains(&p.y)));

        // Each quadrant holds roughly a quarter of the population
        let mut quadrants = [0usize; 4];
        for p in particles {
            let qx = usize::from(p.x >= 320.0);
            let qy = usize::from(p.y >= 180.0);
            quadrants[qy * 2 + qx] += 1;
        }
        for count in quadrants {
            let share = count as f32 / LEN as f32;
            assert!((share - 0.25).abs() < 0.03, "quadrant share {share}");
        }
    }

    #[test]
    fn test_velocities_in_unit_range() {
        let buffer = seeded(Distribution::Uniform, false, 2);
        assert!(buffer
            .particles()
            .iter()
            .all(|p| (-1.0..=1.0).contains(&p.z) && (-1.0..=1.0).contains(&p.w)));

        let mean_vx: f32 = buffer.particles().iter().map(|p| p.z).sum::<f32>() / LEN as f32;
        assert!(mean_vx.abs() < 0.05);
    }

    #[test]
    fn test_gaussian_clusters_at_center() {
        let buffer = seeded(Distribution::Gaussian, false, 3);
        let particles = buffer.particles();

        assert!(particles
            .iter()
            .all(|p| (0.0..640.0).contains(&p.x) && (0.0..360.0).contains(&p.y)));

        let mean_x: f32 = particles.iter().map(|p| p.x).sum::<f32>() / LEN as f32;
        assert!((mean_x - 320.0).abs() < 5.0);

        // About 68% within one sigma of the center
        let within = particles
            .iter()
            .filter(|p| (p.x - 320.0).abs() < 640.0 / 6.0)
            .count() as f32
            / LEN as f32;
        assert!((within - 0.68).abs() < 0.05, "within one sigma: {within}");
    }

    #[test]
    fn test_edges_only_pins_exactly_one_coordinate() {
        for mode in [Distribution::Uniform, Distribution::Gaussian] {
            let buffer = seeded(mode, true, 4);
            let mut seen = [false; 4];
            for p in buffer.particles() {
                let pins = [p.x == 0.0, p.x == 640.0, p.y == 0.0, p.y == 360.0];
                let pinned = pins.iter().filter(|&&pinned| pinned).count();
                assert_eq!(pinned, 1, "{mode:?}: {p:?}");
                for (seen, pinned) in seen.iter_mut().zip(pins) {
                    *seen |= pinned;
                }
            }
            assert_eq!(seen, [true; 4], "{mode:?}");
        }
    }

    #[test]
    fn test_gaussian_tails_are_not_piled_on_bounds() {
        let mut buffer = ParticleBuffer::allocate(100_000).unwrap();
        ParticleInitializer::new(640, 360).fill_seeded(
            &mut buffer,
            Distribution::Gaussian,
            false,
            Some(1),
        );
        let particles = buffer.particles();
        assert!(particles
            .iter()
            .all(|p| (0.0..640.0).contains(&p.x) && (0.0..360.0).contains(&p.y)));

        // A clamp would leave ~0.13% of each tail sitting exactly on a bound
        let on_bounds = particles
            .iter()
            .filter(|p| p.x == 0.0 || p.y == 0.0 || p.x >= 639.99 || p.y >= 359.99)
            .count();
        assert_eq!(on_bounds, 0);
    }

    #[test]
    fn test_zero_extent_axis_does_not_panic() {
        let mut buffer = ParticleBuffer::allocate(256).unwrap();
        for mode in [Distribution::Uniform, Distribution::Gaussian] {
            for edges_only in [false, true] {
                ParticleInitializer::new(0, 10).fill(
                    &mut buffer,
                    mode,
                    edges_only,
                    &mut StdRng::seed_from_u64(5),
                );
                assert!(buffer.particles().iter().all(|p| p.x == 0.0));
                assert!(buffer.particles().iter().all(|p| (0.0..=10.0).contains(&p.y)));
            }
        }
    }

    #[test]
    fn test_same_seed_same_contents() {
        let a = seeded(Distribution::Gaussian, false, 42);
        let b = seeded(Distribution::Gaussian, false, 42);
        let c = seeded(Distribution::Gaussian, false, 43);
        assert_eq!(a.particles(), b.particles());
        assert_ne!(a.particles(), c.particles());
    }

    #[test]
    fn test_fill_overwrites_everything_and_bumps_generation() {
        let mut buffer = ParticleBuffer::allocate(64).unwrap();
        buffer.write(|particles| particles.fill(Particle::new(-9.0, -9.0, 5.0, 5.0)));
        let initializer = ParticleInitializer::new(10, 10);
        initializer.fill(
            &mut buffer,
            Distribution::Uniform,
            false,
            &mut StdRng::seed_from_u64(0),
        );
        assert_eq!(buffer.generation(), 2);
        assert!(buffer.particles().iter().all(|p| p.x >= 0.0 && p.z <= 1.0));
    }
}
