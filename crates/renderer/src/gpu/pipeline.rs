use crate::compile::{compile_pass_module, VERTEX_ENTRY};

use super::context::TARGET_FORMAT;
use super::Program;

/// Texture bindings after the uniform block; unused ones get a placeholder.
pub(crate) const TEXTURE_SLOTS: u32 = 3;

/// One render pipeline per fragment entry point, sharing a single layout.
pub(crate) struct PassPipelines {
    pub bind_layout: wgpu::BindGroupLayout,
    place: wgpu::RenderPipeline,
    blur: wgpu::RenderPipeline,
    stylize: wgpu::RenderPipeline,
    tone: wgpu::RenderPipeline,
    blend: wgpu::RenderPipeline,
    present: wgpu::RenderPipeline,
}

impl PassPipelines {
    pub fn new(device: &wgpu::Device, surface_format: wgpu::TextureFormat) -> Self {
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend((1..=TEXTURE_SLOTS).map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }));
        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pass layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pass pipeline layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });
        let module = compile_pass_module(device);
        let build = |entry: &str, format: wgpu::TextureFormat| {
            build_pipeline(device, &pipeline_layout, &module, entry, format)
        };

        Self {
            place: build("fs_place", TARGET_FORMAT),
            blur: build("fs_blur", TARGET_FORMAT),
            stylize: build("fs_stylize", TARGET_FORMAT),
            tone: build("fs_tone", TARGET_FORMAT),
            blend: build("fs_blend", TARGET_FORMAT),
            present: build("fs_present", surface_format),
            bind_layout,
        }
    }

    pub fn for_program(&self, program: &Program) -> &wgpu::RenderPipeline {
        match program {
            Program::Place(_) => &self.place,
            Program::Blur { .. } => &self.blur,
            Program::Stylize { .. } => &self.stylize,
            Program::Tone(_) => &self.tone,
            Program::Blend { .. } => &self.blend,
        }
    }

    pub fn present(&self) -> &wgpu::RenderPipeline {
        &self.present
    }
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(entry_point),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(VERTEX_ENTRY),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(entry_point),
            // Blending happens in the shader against an explicit base texture.
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}
