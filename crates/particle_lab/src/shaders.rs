//! WGSL compute programs, resolved by name
//!
//! Programs do not declare their own workgroup size. The pipeline prepends
//! `WORKGROUP_SIZE` (1-D particle kernels) or `WORKGROUP_X`/`WORKGROUP_Y`
//! (2-D image kernels) as module constants when it builds them.

use std::collections::HashMap;

use crate::error::{ParticleLabError, Result};

pub const PARTICLE_UPDATE: &str = "particle_update";
pub const DARKEN: &str = "darken";
pub const PARTICLE_CAM: &str = "particle_cam";
pub const PARTICLE_FIELD: &str = "particle_field";
pub const TINT: &str = "tint";

/// Side of the square thread group used by 2-D image kernels
pub const IMAGE_TILE: u32 = 16;

/// How a program's invocations map onto work items
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelShape {
    /// One invocation per particle, `WORKGROUP_SIZE` wide
    Particles,
    /// One invocation per pixel, `IMAGE_TILE` x `IMAGE_TILE`
    Image,
}

#[derive(Clone, Debug)]
pub struct ShaderProgram {
    pub source: String,
    pub shape: KernelShape,
}

impl ShaderProgram {
    /// Module source with the workgroup constants for `granularity` prepended
    pub fn source_for(&self, granularity: u32) -> String {
        let header = match self.shape {
            KernelShape::Particles => format!("const WORKGROUP_SIZE: u32 = {granularity}u;\n"),
            KernelShape::Image => format!(
                "const WORKGROUP_X: u32 = {IMAGE_TILE}u;\nconst WORKGROUP_Y: u32 = {IMAGE_TILE}u;\n"
            ),
        };
        header + &self.source
    }
}

/// Named compute programs available to pipelines
#[derive(Clone, Debug)]
pub struct ShaderLibrary {
    programs: HashMap<String, ShaderProgram>,
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ShaderLibrary {
    /// Library holding every built-in program
    pub fn builtin() -> Self {
        let mut library = Self::empty();
        let particle = |body: &str| format!("{HASH_FUNCTIONS}\n{body}");
        library.register(PARTICLE_UPDATE, particle(PARTICLE_UPDATE_SHADER), KernelShape::Particles);
        library.register(PARTICLE_CAM, particle(PARTICLE_CAM_SHADER), KernelShape::Particles);
        library.register(PARTICLE_FIELD, particle(PARTICLE_FIELD_SHADER), KernelShape::Particles);
        library.register(DARKEN, DARKEN_SHADER, KernelShape::Image);
        library.register(TINT, TINT_SHADER, KernelShape::Image);
        library
    }

    pub fn empty() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }

    /// Add or replace a program; returns the one it replaced
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
        shape: KernelShape,
    ) -> Option<ShaderProgram> {
        self.programs.insert(
            name.into(),
            ShaderProgram {
                source: source.into(),
                shape,
            },
        )
    }

    pub fn get(&self, name: &str) -> Result<&ShaderProgram> {
        self.programs
            .get(name)
            .ok_or_else(|| ParticleLabError::UnknownProgram(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    /// Program names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.programs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Stateless RNG and particle coloring shared by the particle programs
const HASH_FUNCTIONS: &str = r#"
fn pcg_hash(input: u32) -> u32 {
    let state = input * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn rand01(hash: u32) -> f32 {
    return f32(hash >> 8u) / 16777216.0;
}

fn class_color(index: u32, c: vec4<f32>) -> vec4<f32> {
    let bucket = index % 3u;
    if bucket == 1u {
        return vec4<f32>(c.b, c.r, c.g, c.a);
    }
    if bucket == 2u {
        return vec4<f32>(c.g, c.b, c.r, c.a);
    }
    return c;
}

fn respawn(seed_in: u32, extent: vec2<f32>) -> vec4<f32> {
    var seed = seed_in;
    let x = rand01(seed) * (extent.x - 1.0);
    seed = pcg_hash(seed);
    let y = rand01(seed) * (extent.y - 1.0);
    seed = pcg_hash(seed);
    let vx = rand01(seed) * 2.0 - 1.0;
    seed = pcg_hash(seed);
    let vy = rand01(seed) * 2.0 - 1.0;
    return vec4<f32>(x, y, vx, vy);
}

fn outside(p: vec4<f32>, extent: vec2<f32>) -> bool {
    return p.x < 0.0 || p.x >= extent.x || p.y < 0.0 || p.y >= extent.y;
}
"#;

/// Simulation step: integrate, drag, respawn, draw
const PARTICLE_UPDATE_SHADER: &str = r#"
struct SimulationParams {
    color: vec4<f32>,
    extent: vec2<f32>,
    drag: f32,
    respawn: u32,
    frame: u32,
    has_input: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read_write> particles: array<vec4<f32>>;
@group(0) @binding(1) var output: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: SimulationParams;
@group(0) @binding(3) var input_image: texture_2d<f32>;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(
    @builtin(global_invocation_id) id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    // Large grids fold onto y
    let index = id.x + id.y * groups.x * WORKGROUP_SIZE;
    if index >= arrayLength(&particles) {
        return;
    }

    var p = particles[index];
    p = vec4<f32>(p.xy + p.zw, p.zw * params.drag);
    if params.respawn != 0u && outside(p, params.extent) {
        p = respawn(pcg_hash(index ^ pcg_hash(params.frame)), params.extent);
    }
    particles[index] = p;

    let coord = floor(p.xy + 0.5);
    if coord.x < 0.0 || coord.y < 0.0 || coord.x >= params.extent.x || coord.y >= params.extent.y {
        return;
    }

    var color = class_color(index, params.color);
    if params.has_input != 0u {
        let dims = textureDimensions(input_image);
        let scaled = vec2<u32>(coord * vec2<f32>(dims) / params.extent);
        color = color * textureLoad(input_image, min(scaled, dims - 1u), 0);
    }
    textureStore(output, vec2<u32>(coord), color);
}
"#;

/// Filter kernel: particles tinted by the camera frame under them
///
/// The particle buffer is bound twice (read side and write side).
const PARTICLE_CAM_SHADER: &str = r#"
@group(0) @binding(0) var camera: texture_2d<f32>;
@group(0) @binding(1) var output: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<storage, read_write> particles_in: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> particles_out: array<vec4<f32>>;
@group(0) @binding(4) var<uniform> drag: f32;
@group(0) @binding(5) var<uniform> color: vec4<f32>;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(
    @builtin(global_invocation_id) id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    // Large grids fold onto y
    let index = id.x + id.y * groups.x * WORKGROUP_SIZE;
    if index >= arrayLength(&particles_in) {
        return;
    }

    let dims = textureDimensions(output);
    let extent = vec2<f32>(dims);
    var p = particles_in[index];
    p = vec4<f32>(p.xy + p.zw, p.zw * drag);
    if outside(p, extent) {
        p = respawn(pcg_hash(index ^ pcg_hash(bitcast<u32>(p.x) ^ bitcast<u32>(p.y))), extent);
    }
    particles_out[index] = p;

    let coord = min(vec2<u32>(floor(p.xy + 0.5)), dims - 1u);
    let under = textureLoad(camera, coord, 0);
    textureStore(output, coord, class_color(index, color) * under);
}
"#;

/// Generator kernel: the camera-less variant of `particle_cam`
const PARTICLE_FIELD_SHADER: &str = r#"
@group(0) @binding(0) var output: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(1) var<storage, read_write> particles_in: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> particles_out: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> drag: f32;
@group(0) @binding(4) var<uniform> color: vec4<f32>;

@compute @workgroup_size(WORKGROUP_SIZE)
fn main(
    @builtin(global_invocation_id) id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    // Large grids fold onto y
    let index = id.x + id.y * groups.x * WORKGROUP_SIZE;
    if index >= arrayLength(&particles_in) {
        return;
    }

    let dims = textureDimensions(output);
    let extent = vec2<f32>(dims);
    var p = particles_in[index];
    p = vec4<f32>(p.xy + p.zw, p.zw * drag);
    if outside(p, extent) {
        p = respawn(pcg_hash(index ^ pcg_hash(bitcast<u32>(p.x) ^ bitcast<u32>(p.y))), extent);
    }
    particles_out[index] = p;

    let coord = min(vec2<u32>(floor(p.xy + 0.5)), dims - 1u);
    textureStore(output, coord, class_color(index, color));
}
"#;

/// Trail fade: rgb scaled by decay, alpha kept
const DARKEN_SHADER: &str = r#"
struct DarkenParams {
    decay: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}

@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(1) var destination: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: DarkenParams;

@compute @workgroup_size(WORKGROUP_X, WORKGROUP_Y)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = textureDimensions(source);
    if id.x >= dims.x || id.y >= dims.y {
        return;
    }
    let c = textureLoad(source, id.xy, 0);
    textureStore(destination, id.xy, vec4<f32>(c.rgb * params.decay, c.a));
}
"#;

const TINT_SHADER: &str = r#"
@group(0) @binding(0) var input_image: texture_2d<f32>;
@group(0) @binding(1) var output: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> tint: vec4<f32>;
@group(0) @binding(3) var<uniform> strength: f32;

@compute @workgroup_size(WORKGROUP_X, WORKGROUP_Y)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let dims = textureDimensions(input_image);
    if id.x >= dims.x || id.y >= dims.y {
        return;
    }
    let c = textureLoad(input_image, id.xy, 0);
    let tinted = c.rgb * tint.rgb;
    textureStore(output, id.xy, vec4<f32>(mix(c.rgb, tinted, strength), c.a));
}
"#;

/// Fullscreen blit of the render target onto the surface
pub const PRESENT_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var frame: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;

@vertex
fn vs_main(@builtin(vertex_index) vertex: u32) -> VertexOutput {
    // One triangle covering the viewport
    let uv = vec2<f32>(f32((vertex << 1u) & 2u), f32(vertex & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(uv * vec2<f32>(2.0, -2.0) + vec2<f32>(-1.0, 1.0), 0.0, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(frame, frame_sampler, in.uv);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(source)));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|e| panic!("{e:?}"));
    }

    #[test]
    fn test_builtin_programs_present() {
        let library = ShaderLibrary::builtin();
        assert_eq!(
            library.names(),
            vec![DARKEN, PARTICLE_CAM, PARTICLE_FIELD, PARTICLE_UPDATE, TINT]
        );
        assert_eq!(library.get(PARTICLE_UPDATE).unwrap().shape, KernelShape::Particles);
        assert_eq!(library.get(DARKEN).unwrap().shape, KernelShape::Image);
    }

    #[test]
    fn test_unknown_program() {
        let library = ShaderLibrary::builtin();
        assert!(matches!(
            library.get("missing"),
            Err(ParticleLabError::UnknownProgram(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_register_replaces() {
        let mut library = ShaderLibrary::empty();
        assert!(library.register("custom", "// a", KernelShape::Image).is_none());
        let old = library.register("custom", "// b", KernelShape::Particles).unwrap();
        assert_eq!(old.source, "// a");
        assert_eq!(library.get("custom").unwrap().source, "// b");
    }

    #[test]
    fn test_workgroup_header() {
        let library = ShaderLibrary::builtin();
        let source = library.get(PARTICLE_UPDATE).unwrap().source_for(32);
        assert!(source.starts_with("const WORKGROUP_SIZE: u32 = 32u;\n"));
        let source = library.get(TINT).unwrap().source_for(32);
        assert!(source.starts_with("const WORKGROUP_X: u32 = 16u;\n"));
    }

    #[test]
    fn test_builtin_programs_validate() {
        let library = ShaderLibrary::builtin();
        for name in library.names() {
            validate(&library.get(name).unwrap().source_for(64));
        }
        validate(PRESENT_SHADER);
    }

    #[test]
    fn test_particle_kernels_linearize_folded_grid() {
        let library = ShaderLibrary::builtin();
        for name in [PARTICLE_UPDATE, PARTICLE_CAM, PARTICLE_FIELD] {
            let program = library.get(name).unwrap();
            assert_eq!(program.shape, KernelShape::Particles);
            assert!(
                program
                    .source
                    .contains("let index = id.x + id.y * groups.x * WORKGROUP_SIZE;"),
                "{name} indexes only along x"
            );
        }
    }
}
