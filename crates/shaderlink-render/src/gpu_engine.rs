//! The wgpu-backed render engine.
//!
//! Every material is a sphere shaded by a WGSL program. The engine generates
//! a default program per material from its declared parameters; user
//! programs replace it through the control plane. All materials are drawn
//! side by side in vertical strips of one frame.
//!
//! Programs see one uniform block at `@group(0) @binding(0)`:
//!
//! ```wgsl
//! struct Uniforms {
//!     resolution: vec4<f32>, // strip width, height, strip origin x, y
//!     camera: vec4<f32>,     // xyz position, looking at the origin
//!     params: array<vec4<f32>, 16>,
//! };
//! ```
//!
//! Entry points are `vs_main` in the vertex stage and `fs_main` in the
//! fragment stage. The vertex stage draws one full-screen triangle.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use shaderlink_core::{
    check_dimensions, GeneratedProgram, MaterialConfig, MaterialId, ParameterInfo, ParameterKind,
    RenderConfig, RenderEngine, RenderedImage, ShaderSource, ShaderlinkError, ShaderlinkResult,
    UniformValue, Vec3,
};

use crate::gpu::GpuContext;

/// Parameter slots available to one material.
pub const MAX_PARAMS: usize = 16;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MaterialUniforms {
    resolution: [f32; 4],
    camera: [f32; 4],
    params: [[f32; 4]; MAX_PARAMS],
}

const VERTEX_SOURCE: &str = r#"// Full-screen triangle.
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32((index << 1u) & 2u);
    let y = f32(index & 2u);
    return vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
}
"#;

const FRAGMENT_HEADER: &str = r#"struct Uniforms {
    resolution: vec4<f32>,
    camera: vec4<f32>,
    params: array<vec4<f32>, 16>,
};

@group(0) @binding(0) var<uniform> u: Uniforms;

fn checker(n: vec3<f32>) -> f32 {
    let c = floor(n * 4.0);
    return 0.5 + 0.5 * (abs(c.x + c.y + c.z) % 2.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let size = u.resolution.xy;
    let p = ((frag.xy - u.resolution.zw) / size) * 2.0 - vec2<f32>(1.0, 1.0);
    let ro = u.camera.xyz;
    let forward = normalize(-ro);
    let hint = select(vec3<f32>(0.0, 1.0, 0.0), vec3<f32>(0.0, 0.0, 1.0), abs(forward.y) > 0.99);
    let right = normalize(cross(forward, hint));
    let up = cross(right, forward);
    let rd = normalize(forward * 1.5 + right * p.x * (size.x / size.y) - up * p.y);

    let b = dot(ro, rd);
    let h = b * b - (dot(ro, ro) - 1.0);
    if (h < 0.0) {
        return vec4<f32>(0.08, 0.08, 0.1, 1.0);
    }
    let n = normalize(ro + rd * (-b - sqrt(h)));
    let l = normalize(vec3<f32>(0.6, 0.8, 0.4));

    var albedo = vec3<f32>(1.0, 1.0, 1.0);
    var shininess = 32.0;
    var glow = 0.0;
"#;

const FRAGMENT_FOOTER: &str = r#"
    let diffuse = max(dot(n, l), 0.0);
    let spec = pow(max(dot(reflect(-l, n), -rd), 0.0), shininess);
    let color = albedo * (0.15 + 0.85 * diffuse) + vec3<f32>(spec * 0.5) + albedo * glow;
    return vec4<f32>(clamp(color, vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}
"#;

/// A linked pipeline. Clones share it.
#[derive(Clone)]
pub struct GpuProgram {
    pipeline: Arc<wgpu::RenderPipeline>,
}

impl std::fmt::Debug for GpuProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuProgram").finish_non_exhaustive()
    }
}

struct GpuMaterial {
    name: String,
    parameters: Vec<ParameterInfo>,
    /// `params[]` slot of every mutable parameter.
    slots: BTreeMap<String, usize>,
    values: BTreeMap<String, UniformValue>,
    bound: Option<GpuProgram>,
    uniform_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl GpuMaterial {
    fn uniforms(&self, resolution: [f32; 4], camera: Vec3) -> MaterialUniforms {
        MaterialUniforms {
            resolution,
            camera: [camera[0], camera[1], camera[2], 1.0],
            params: pack_params(&self.slots, &self.values),
        }
    }
}

fn pack_params(
    slots: &BTreeMap<String, usize>,
    values: &BTreeMap<String, UniformValue>,
) -> [[f32; 4]; MAX_PARAMS] {
    let mut params = [[0.0; 4]; MAX_PARAMS];
    for (path, &slot) in slots {
        params[slot] = match values.get(path) {
            Some(UniformValue::Float(v)) => [*v, 0.0, 0.0, 0.0],
            Some(UniformValue::Color3([r, g, b])) => [*r, *g, *b, 0.0],
            Some(UniformValue::Boolean(on)) => [if *on { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
            None => [0.0; 4],
        };
    }
    params
}

/// Build the engine-authored program of a material.
fn generate_source(name: &str, parameters: &[ParameterInfo], slots: &BTreeMap<String, usize>) -> ShaderSource {
    let clean = |s: &str| s.replace(|c: char| c.is_control(), " ");
    let mut fragment = format!("// Generated by shaderlink for material '{}'\n", clean(name));
    fragment.push_str(FRAGMENT_HEADER);

    for info in parameters {
        let Some(slot) = slots.get(&info.path) else {
            continue;
        };
        let line = match &info.kind {
            ParameterKind::Color3 => format!("albedo = albedo * u.params[{slot}].xyz;"),
            ParameterKind::Float if info.path.contains("rough") => {
                format!("shininess = mix(128.0, 2.0, clamp(u.params[{slot}].x, 0.0, 1.0));")
            }
            ParameterKind::Float => format!("glow = glow + u.params[{slot}].x * 0.1;"),
            ParameterKind::Boolean => {
                format!("if (u.params[{slot}].x > 0.5) {{ albedo = albedo * checker(n); }}")
            }
            ParameterKind::String | ParameterKind::Unsupported(_) => continue,
        };
        let _ = writeln!(fragment, "    {} // {}", line, clean(&info.path));
    }

    fragment.push_str(FRAGMENT_FOOTER);
    ShaderSource::new(VERTEX_SOURCE, fragment)
}

/// Split `width` into `count` strips as `(x, width)`; the last takes the rest.
fn strip_layout(width: u32, count: usize) -> Vec<(u32, u32)> {
    let Ok(n) = u32::try_from(count) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    let base = width / n;
    (0..n)
        .map(|i| {
            let w = if i == n - 1 { width - base * (n - 1) } else { base };
            (base * i, w)
        })
        .collect()
}

fn padded_bytes_per_row(width: u32) -> u32 {
    (width * 4 + 255) & !255
}

pub struct GpuEngine {
    gpu: GpuContext,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    materials: Vec<GpuMaterial>,
    selected: Option<usize>,
    camera: Vec3,
}

impl GpuEngine {
    pub fn new(render: &RenderConfig, materials: &[MaterialConfig]) -> ShaderlinkResult<Self> {
        let gpu = GpuContext::init(&render.power_preference).map_err(|e| {
            ShaderlinkError::Render(format!("Failed to initialize WGPU context: {:#}", e))
        })?;
        Self::with_context(gpu, materials)
    }

    pub fn with_context(gpu: GpuContext, materials: &[MaterialConfig]) -> ShaderlinkResult<Self> {
        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("shaderlink_material_bind_group_layout"),
                    entries: &[wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    }],
                });
        let pipeline_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("shaderlink_material_pipeline_layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let mut engine = Self {
            gpu,
            bind_group_layout,
            pipeline_layout,
            materials: Vec::with_capacity(materials.len()),
            selected: None,
            camera: [0.0, 0.0, 3.0],
        };
        for config in materials {
            let material = engine.build_material(config)?;
            engine.materials.push(material);
        }
        engine.selected = (!engine.materials.is_empty()).then_some(0);
        tracing::info!("GPU engine ready with {} materials", engine.materials.len());
        Ok(engine)
    }

    fn build_material(&self, config: &MaterialConfig) -> ShaderlinkResult<GpuMaterial> {
        let mut slots = BTreeMap::new();
        let mut values = BTreeMap::new();
        for param in &config.parameters {
            if let Some(value) = param.initial_value()? {
                if slots.len() == MAX_PARAMS {
                    return Err(ShaderlinkError::Config(format!(
                        "material '{}' declares more than {} mutable parameters",
                        config.name, MAX_PARAMS
                    )));
                }
                slots.insert(param.name.clone(), slots.len());
                values.insert(param.name.clone(), value);
            }
        }

        let uniform_buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("shaderlink_material_uniforms"),
            size: std::mem::size_of::<MaterialUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shaderlink_material_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        Ok(GpuMaterial {
            name: config.name.clone(),
            parameters: config.parameters.iter().map(|p| p.info()).collect(),
            slots,
            values,
            bound: None,
            uniform_buffer,
            bind_group,
        })
    }

    fn material(&self, material: MaterialId) -> ShaderlinkResult<&GpuMaterial> {
        self.materials
            .get(material.0)
            .ok_or_else(|| ShaderlinkError::state(format!("{} does not exist", material)))
    }

    fn material_mut(&mut self, material: MaterialId) -> ShaderlinkResult<&mut GpuMaterial> {
        self.materials
            .get_mut(material.0)
            .ok_or_else(|| ShaderlinkError::state(format!("{} does not exist", material)))
    }

    /// Record one frame into a pooled target. Nothing is submitted yet.
    fn encode_frame(
        &mut self,
        width: u32,
        height: u32,
    ) -> ShaderlinkResult<(wgpu::Texture, wgpu::CommandEncoder)> {
        check_dimensions(width, height)?;
        let target = self.gpu.texture_pool.acquire(
            &self.gpu.device,
            Some("shaderlink_frame_target"),
            width,
            height,
            TARGET_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let strips = strip_layout(width, self.materials.len());

        for (material, &(x, w)) in self.materials.iter().zip(&strips) {
            let uniforms = material.uniforms([w as f32, height as f32, x as f32, 0.0], self.camera);
            self.gpu
                .queue
                .write_buffer(&material.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        }

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("shaderlink_frame_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("shaderlink_frame"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
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
            for (material, &(x, w)) in self.materials.iter().zip(&strips) {
                let Some(program) = &material.bound else {
                    continue;
                };
                if w == 0 {
                    continue;
                }
                pass.set_viewport(x as f32, 0.0, w as f32, height as f32, 0.0, 1.0);
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &material.bind_group, &[]);
                pass.draw(0..3, 0..1);
            }
        }
        Ok((target, encoder))
    }

    fn read_back(
        &mut self,
        target: wgpu::Texture,
        mut encoder: wgpu::CommandEncoder,
    ) -> ShaderlinkResult<RenderedImage> {
        let (width, height) = (target.width(), target.height());
        let padded = padded_bytes_per_row(width);
        let readback = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("shaderlink_readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));
        // The copy is queued; the texture can serve the next frame whether or
        // not the map below succeeds.
        self.gpu.texture_pool.release(target);

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| ShaderlinkError::Render("readback callback was dropped".into()))?
            .map_err(|e| ShaderlinkError::Render(format!("Failed to map frame buffer: {}", e)))?;

        let row_len = (width * 4) as usize;
        let mut rgba = Vec::with_capacity(row_len * height as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(padded as usize).take(height as usize) {
                rgba.extend_from_slice(&row[..row_len]);
            }
        }
        readback.unmap();

        Ok(RenderedImage::from_rgba(width, height, &rgba))
    }
}

impl RenderEngine for GpuEngine {
    type Program = GpuProgram;

    fn compile(&mut self, source: &ShaderSource) -> ShaderlinkResult<GpuProgram> {
        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shaderlink_vertex"),
            source: wgpu::ShaderSource::Wgsl(source.vertex.as_str().into()),
        });
        let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shaderlink_fragment"),
            source: wgpu::ShaderSource::Wgsl(source.fragment.as_str().into()),
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("shaderlink_material_pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ShaderlinkError::compile_log(&error.to_string()));
        }
        tracing::debug!("compiled program");
        Ok(GpuProgram {
            pipeline: Arc::new(pipeline),
        })
    }

    fn bind(&mut self, material: MaterialId, program: &GpuProgram) -> ShaderlinkResult<()> {
        self.material_mut(material)?.bound = Some(program.clone());
        Ok(())
    }

    fn render(&mut self, width: u32, height: u32) -> ShaderlinkResult<RenderedImage> {
        let (target, encoder) = self.encode_frame(width, height)?;
        self.read_back(target, encoder)
    }

    fn draw(&mut self, width: u32, height: u32) -> ShaderlinkResult<()> {
        let (target, encoder) = self.encode_frame(width, height)?;
        self.gpu.queue.submit(Some(encoder.finish()));
        self.gpu.device.poll(wgpu::Maintain::Wait);
        self.gpu.texture_pool.release(target);
        Ok(())
    }

    fn regenerate_default_program(
        &mut self,
        material: MaterialId,
    ) -> ShaderlinkResult<GeneratedProgram<GpuProgram>> {
        let m = self.material(material)?;
        let source = generate_source(&m.name, &m.parameters, &m.slots);
        let program = self.compile(&source)?;
        Ok(GeneratedProgram { program, source })
    }

    fn materials(&self) -> Vec<MaterialId> {
        (0..self.materials.len()).map(MaterialId).collect()
    }

    fn selected_material(&self) -> Option<MaterialId> {
        self.selected.map(MaterialId)
    }

    fn material_name(&self, material: MaterialId) -> Option<String> {
        self.materials.get(material.0).map(|m| m.name.clone())
    }

    fn parameters(&self, material: MaterialId) -> Vec<ParameterInfo> {
        self.materials
            .get(material.0)
            .map(|m| m.parameters.clone())
            .unwrap_or_default()
    }

    fn parameter_value(&self, material: MaterialId, path: &str) -> ShaderlinkResult<UniformValue> {
        self.material(material)?
            .values
            .get(path)
            .copied()
            .ok_or_else(|| ShaderlinkError::state(format!("{} has no parameter '{}'", material, path)))
    }

    fn set_parameter_value(
        &mut self,
        material: MaterialId,
        path: &str,
        value: UniformValue,
    ) -> ShaderlinkResult<()> {
        let current = self.parameter_value(material, path)?;
        if current.kind() != value.kind() {
            return Err(ShaderlinkError::validation(format!(
                "Invalid {} value for {}",
                current.kind(),
                path
            )));
        }
        self.material_mut(material)?
            .values
            .insert(path.to_string(), value);
        Ok(())
    }

    fn camera_position(&self) -> Vec3 {
        self.camera
    }

    fn set_camera_position(&mut self, position: Vec3) {
        self.camera = position;
    }
}
