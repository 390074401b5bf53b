//! Host-side cost of seeding and the reference particle kernel
//!
//!   cargo bench -p particle_lab

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use particle_lab::reference::{self, ReferenceTarget, SimulationUniforms};
use particle_lab::{Distribution, ParticleBuffer, ParticleColor, ParticleInitializer};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn seeded_buffer(count: usize) -> ParticleBuffer {
    let mut buffer = ParticleBuffer::allocate(count).expect("allocate particles");
    ParticleInitializer::new(WIDTH, HEIGHT).fill_seeded(
        &mut buffer,
        Distribution::Uniform,
        false,
        Some(7),
    );
    buffer
}

fn bench_initializer(c: &mut Criterion) {
    let initializer = ParticleInitializer::new(WIDTH, HEIGHT);
    let mut buffer = ParticleBuffer::allocate(1 << 16).expect("allocate particles");
    let mut rng = StdRng::seed_from_u64(1);

    let mut group = c.benchmark_group("initializer");
    for (name, mode, edges) in [
        ("uniform", Distribution::Uniform, false),
        ("gaussian", Distribution::Gaussian, false),
        ("uniform_edges", Distribution::Uniform, true),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| initializer.fill(&mut buffer, mode, edges, &mut rng))
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_reference");
    for count in [1usize << 12, 1 << 16] {
        let buffer = seeded_buffer(count);
        let mut particles = buffer.particles().to_vec();
        let mut target = ReferenceTarget::new(WIDTH, HEIGHT);
        let mut frame = 0u32;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let uniforms = SimulationUniforms::new(
                    ParticleColor::default(),
                    (WIDTH, HEIGHT),
                    0.99,
                    true,
                    frame,
                    false,
                );
                reference::dispatch_reference(
                    black_box(&mut particles),
                    64,
                    &uniforms,
                    &mut target,
                    None,
                );
                frame = frame.wrapping_add(1);
            })
        });
    }
    group.finish();
}

fn bench_darken(c: &mut Criterion) {
    let mut target = ReferenceTarget::new(WIDTH, HEIGHT);
    c.bench_function("darken_reference_640x480", |b| {
        b.iter(|| reference::darken_reference(black_box(&mut target), 0.9))
    });
}

criterion_group!(benches, bench_initializer, bench_dispatch, bench_darken);
criterion_main!(benches);
