//! GPU execution of a shader chain on a headless wgpu device.
//!
//! Each pass renders a fullscreen triangle into an RGBA8 target texture.
//! Targets are cached by name and reallocated only when their size
//! changes; the caller's input is uploaded under the name `MAIN`. The
//! device is created lazily with no surface and lives until the chain is
//! dropped.

use std::collections::HashMap;
use std::sync::mpsc;

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::directive::{assemble_fragment, chain_output_size, parse_pass, ParsedPass};
use crate::error::ChainError;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const VERTEX_SHADER: &str = "\
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let xy = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(xy * 2.0 - 1.0, 0.0, 1.0);
    out.tex_coord = vec2<f32>(xy.x, 1.0 - xy.y);
    return out;
}
";

struct CompiledPass {
    parsed: ParsedPass,
    pipeline: wgpu::RenderPipeline,
    bind_layout: wgpu::BindGroupLayout,
}

struct CachedTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
}

/// A compiled shader chain bound to a headless GPU device.
pub struct ShaderChain {
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    passes: Vec<CompiledPass>,
    targets: HashMap<String, CachedTarget>,
}

impl ShaderChain {
    /// Compile `sources` (annotated fragment shaders) into an executable
    /// chain. `names` are per-source labels used in diagnostics.
    pub fn load(sources: &[String], names: &[String]) -> Result<Self, ChainError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|_| ChainError::NoAdapter)?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("shader chain device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: Default::default(),
        }))
        .map_err(|e| ChainError::Gpu(e.to_string()))?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("chain sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("chain vertex shader"),
            source: wgpu::ShaderSource::Wgsl(VERTEX_SHADER.into()),
        });

        let mut passes = Vec::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            let name = names.get(i).map(String::as_str).unwrap_or("<unnamed>");
            let parsed = parse_pass(source, name);
            let pass = compile_pass(&device, &vertex_module, parsed)?;
            info!(
                name,
                desc = %pass.parsed.desc,
                save = %pass.parsed.save_target,
                scale_x = pass.parsed.scale_x,
                scale_y = pass.parsed.scale_y,
                "loaded shader pass"
            );
            passes.push(pass);
        }

        Ok(Self {
            device,
            queue,
            sampler,
            passes,
            targets: HashMap::new(),
        })
    }

    /// Output size the chain produces for a `width x height` input.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let parsed: Vec<ParsedPass> = self.passes.iter().map(|p| p.parsed.clone()).collect();
        chain_output_size(&parsed, width, height)
    }

    /// Run the chain over packed RGBA8 pixels. Returns the output pixels
    /// and their dimensions.
    pub fn process(
        &mut self,
        input: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Vec<u8>, u32, u32), ChainError> {
        if width == 0 || height == 0 {
            return Err(ChainError::InvalidBuffer("empty input image".into()));
        }
        if input.len() < (width * height * 4) as usize {
            return Err(ChainError::InvalidBuffer(format!(
                "input holds {} bytes, need {}",
                input.len(),
                width * height * 4
            )));
        }

        self.ensure_target("MAIN", width, height);
        let main = &self.targets["MAIN"];
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &main.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &input[..(width * height * 4) as usize],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        let mut cur_w = width;
        let mut cur_h = height;
        let mut last_target = "MAIN".to_string();

        for i in 0..self.passes.len() {
            let (save, scale_x, scale_y, bind_targets) = {
                let p = &self.passes[i].parsed;
                (
                    p.save_target.clone(),
                    p.scale_x,
                    p.scale_y,
                    p.bind_targets.clone(),
                )
            };
            let next_w = (cur_w as f32 * scale_x) as u32;
            let next_h = (cur_h as f32 * scale_y) as u32;
            self.ensure_target(&save, next_w, next_h);

            let mut entries = vec![wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            }];
            let mut size_buffers = Vec::with_capacity(bind_targets.len());
            for bname in &bind_targets {
                let bound = self.targets.get(bname).ok_or_else(|| {
                    ChainError::Gpu(format!("render target {bname:?} is not available"))
                })?;
                size_buffers.push((
                    &bound.view,
                    self.device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("pass size uniform"),
                            contents: bytemuck::cast_slice(&[
                                bound.size.0 as f32,
                                bound.size.1 as f32,
                            ]),
                            usage: wgpu::BufferUsages::UNIFORM,
                        }),
                ));
            }
            for (j, (view, buffer)) in size_buffers.iter().enumerate() {
                entries.push(wgpu::BindGroupEntry {
                    binding: (2 * j + 1) as u32,
                    resource: wgpu::BindingResource::TextureView(*view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: (2 * j + 2) as u32,
                    resource: buffer.as_entire_binding(),
                });
            }

            let pass = &self.passes[i];
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pass bind group"),
                layout: &pass.bind_layout,
                entries: &entries,
            });

            let out_view = &self.targets[&save].view;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("pass encoder"),
                });
            {
                let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("chain pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: out_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    ..Default::default()
                });
                rpass.set_pipeline(&pass.pipeline);
                rpass.set_bind_group(0, &bind_group, &[]);
                rpass.draw(0..3, 0..1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));

            cur_w = next_w;
            cur_h = next_h;
            last_target = save;
        }

        debug!(out_w = cur_w, out_h = cur_h, "shader chain executed");
        let pixels = self.read_back(&last_target, cur_w, cur_h)?;
        Ok((pixels, cur_w, cur_h))
    }

    /// Allocate-or-reuse a named target; reallocates on size change.
    fn ensure_target(&mut self, name: &str, width: u32, height: u32) {
        if let Some(existing) = self.targets.get(name) {
            if existing.size == (width, height) {
                return;
            }
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(name),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.targets.insert(
            name.to_string(),
            CachedTarget {
                texture,
                view,
                size: (width, height),
            },
        );
    }

    fn read_back(&self, name: &str, width: u32, height: u32) -> Result<Vec<u8>, ChainError> {
        let target = self
            .targets
            .get(name)
            .ok_or_else(|| ChainError::Gpu(format!("render target {name:?} is not available")))?;

        let unpadded_bpr = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bpr = unpadded_bpr.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chain readback"),
            size: (padded_bpr * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bpr),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| ChainError::Gpu(format!("device poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| ChainError::Gpu("readback mapping was dropped".into()))?
            .map_err(|e| ChainError::Gpu(format!("readback mapping failed: {e}")))?;

        let data = slice.get_mapped_range();
        let mut pixels = vec![0u8; (unpadded_bpr * height) as usize];
        for y in 0..height as usize {
            let src = y * padded_bpr as usize;
            let dst = y * unpadded_bpr as usize;
            pixels[dst..dst + unpadded_bpr as usize]
                .copy_from_slice(&data[src..src + unpadded_bpr as usize]);
        }
        drop(data);
        buffer.unmap();
        Ok(pixels)
    }
}

fn compile_pass(
    device: &wgpu::Device,
    vertex_module: &wgpu::ShaderModule,
    parsed: ParsedPass,
) -> Result<CompiledPass, ChainError> {
    let fragment_source = assemble_fragment(&parsed);

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&parsed.name),
        source: wgpu::ShaderSource::Glsl {
            shader: fragment_source.into(),
            stage: wgpu::naga::ShaderStage::Fragment,
            defines: Default::default(),
        },
    });

    let mut entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }];
    for j in 0..parsed.bind_targets.len() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: (2 * j + 1) as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: (2 * j + 2) as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }

    let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("pass bind layout"),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("pass pipeline layout"),
        bind_group_layouts: &[&bind_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&parsed.name),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: vertex_module,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &fragment_module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
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
        cache: None,
    });

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(ChainError::Compile {
            name: parsed.name,
            reason: error.to_string(),
        });
    }

    Ok(CompiledPass {
        parsed,
        pipeline,
        bind_layout,
    })
}
