use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::TryRecvError;
use image::RgbaImage;

use super::context::{GpuContext, Presenter, TARGET_FORMAT};
use super::pipeline::{PassPipelines, TEXTURE_SLOTS};
use super::uniforms::PassUniforms;
use super::{
    check_dimensions, BackendKind, BackendLimits, DrawCall, FrameStamp, GpuBackend, GpuError,
    Program, TextureHandle,
};
use crate::protocol::WindowSurface;
use crate::types::BlendMode;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl GpuTexture {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    fn copy_info(&self) -> wgpu::TexelCopyTextureInfo<'_> {
        wgpu::TexelCopyTextureInfo {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }
}

/// Creates a texture, surfacing allocation failures as resource errors.
fn allocate_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    label: &str,
) -> Result<GpuTexture, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
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
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(GpuError::Resource(format!(
            "failed to allocate {width}x{height} texture: {err}"
        )));
    }
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Ok(GpuTexture {
        texture,
        view,
        width,
        height,
    })
}

/// [`GpuBackend`] on a real device: every texture handle maps to a
/// `wgpu::Texture` and every draw is a fullscreen triangle.
pub struct WgpuBackend {
    context: GpuContext,
    pipelines: PassPipelines,
    uniform_buffer: wgpu::Buffer,
    placeholder: GpuTexture,
    textures: HashMap<u64, GpuTexture>,
    next_handle: u64,
}

impl WgpuBackend {
    pub fn headless(width: u32, height: u32) -> Result<Self, GpuError> {
        let context = GpuContext::headless(width, height)
            .map_err(|err| GpuError::Init(format!("{err:#}")))?;
        Self::from_context(context)
    }

    pub fn for_window(
        window: Arc<dyn WindowSurface>,
        width: u32,
        height: u32,
    ) -> Result<Self, GpuError> {
        let context = GpuContext::for_window(window, width, height)
            .map_err(|err| GpuError::Init(format!("{err:#}")))?;
        Self::from_context(context)
    }

    fn from_context(context: GpuContext) -> Result<Self, GpuError> {
        let pipelines = PassPipelines::new(&context.device, context.surface_format);
        let uniform_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass uniforms"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let placeholder = allocate_texture(&context.device, 1, 1, "placeholder")?;
        tracing::debug!(
            surface_format = ?context.surface_format,
            max_texture_dimension = context.max_texture_dimension,
            "wgpu backend ready"
        );
        Ok(Self {
            context,
            pipelines,
            uniform_buffer,
            placeholder,
            textures: HashMap::new(),
            next_handle: 1,
        })
    }

    fn texture(&self, handle: TextureHandle) -> Result<&GpuTexture, GpuError> {
        self.textures
            .get(&handle.raw())
            .ok_or(GpuError::UnknownTexture(handle))
    }

    fn insert(&mut self, texture: GpuTexture) -> TextureHandle {
        let handle = TextureHandle::new(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(handle.raw(), texture);
        handle
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Encodes one fullscreen draw of `pipeline` into `target` and submits it.
    fn run_pass(
        &self,
        pipeline: &wgpu::RenderPipeline,
        uniforms: &PassUniforms,
        inputs: &[&wgpu::TextureView],
        target: &wgpu::TextureView,
    ) {
        self.context
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(uniforms));

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: self.uniform_buffer.as_entire_binding(),
        }];
        for slot in 0..TEXTURE_SLOTS {
            let view = inputs
                .get(slot as usize)
                .copied()
                .unwrap_or(&self.placeholder.view);
            entries.push(wgpu::BindGroupEntry {
                binding: slot + 1,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pass bind group"),
                layout: &self.pipelines.bind_layout,
                entries: &entries,
            });

        let mut encoder = self.encoder("pass encoder");
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("layer pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));
    }

    fn clear_view(&self, view: &wgpu::TextureView) {
        let mut encoder = self.encoder("clear encoder");
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        self.context.queue.submit(std::iter::once(encoder.finish()));
    }

    fn blit_to(
        &self,
        target: &wgpu::TextureView,
        source: Option<&GpuTexture>,
        surface: (u32, u32),
    ) {
        match source {
            Some(source) => {
                let uniforms = PassUniforms::for_present(source.size(), surface);
                self.run_pass(self.pipelines.present(), &uniforms, &[&source.view], target);
            }
            None => self.clear_view(target),
        }
    }

    fn require_same_size(
        &self,
        program: &Program,
        input: TextureHandle,
        target: (u32, u32),
    ) -> Result<(), GpuError> {
        let size = self.texture(input)?.size();
        if size != target {
            return Err(GpuError::Operation(format!(
                "{} pass input {input} is {}x{}, target is {}x{}",
                program.name(),
                size.0,
                size.1,
                target.0,
                target.1
            )));
        }
        Ok(())
    }
}

impl GpuBackend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits {
            max_texture_dimension: self.context.max_texture_dimension,
        }
    }

    fn supports_blend(&self, _mode: BlendMode) -> bool {
        true
    }

    fn create_target(&mut self, width: u32, height: u32) -> Result<TextureHandle, GpuError> {
        check_dimensions(width, height, self.limits())?;
        // wgpu zero-initialises new textures, which is transparent black.
        let texture = allocate_texture(&self.context.device, width, height, "render target")?;
        Ok(self.insert(texture))
    }

    fn upload(&mut self, pixels: &RgbaImage) -> Result<TextureHandle, GpuError> {
        let (width, height) = pixels.dimensions();
        check_dimensions(width, height, self.limits())?;
        let texture = allocate_texture(&self.context.device, width, height, "uploaded source")?;
        self.context.queue.write_texture(
            texture.copy_info(),
            pixels.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            texture.extent(),
        );
        Ok(self.insert(texture))
    }

    fn destroy(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.remove(&handle.raw()) {
            texture.texture.destroy();
        }
    }

    fn dimensions(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&handle.raw()).map(GpuTexture::size)
    }

    fn clear(&mut self, target: TextureHandle) -> Result<(), GpuError> {
        let texture = self.texture(target)?;
        self.clear_view(&texture.view);
        Ok(())
    }

    fn copy(&mut self, source: TextureHandle, target: TextureHandle) -> Result<(), GpuError> {
        if source == target {
            return Err(GpuError::Hazard(target));
        }
        let from = self.texture(source)?;
        let to = self.texture(target)?;
        if from.size() != to.size() {
            return Err(GpuError::Operation(format!(
                "copy from {source} ({}x{}) into {target} ({}x{})",
                from.width, from.height, to.width, to.height
            )));
        }
        let mut encoder = self.encoder("copy encoder");
        encoder.copy_texture_to_texture(from.copy_info(), to.copy_info(), to.extent());
        self.context.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        call.validate()?;
        let target = self.texture(call.target)?;
        let size = target.size();
        if !matches!(call.program, Program::Place(_)) {
            for input in call.inputs {
                self.require_same_size(&call.program, *input, size)?;
            }
        }
        let inputs = call
            .inputs
            .iter()
            .map(|handle| self.texture(*handle).map(|texture| &texture.view))
            .collect::<Result<Vec<_>, _>>()?;
        let uniforms = PassUniforms::for_program(&call.program);
        self.run_pass(
            self.pipelines.for_program(&call.program),
            &uniforms,
            &inputs,
            &target.view,
        );
        Ok(())
    }

    fn read_back(&mut self, handle: TextureHandle) -> Result<RgbaImage, GpuError> {
        let texture = self.texture(handle)?;
        let (width, height) = texture.size();
        let row_bytes = width * 4;
        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.encoder("readback encoder");
        encoder.copy_texture_to_buffer(
            texture.copy_info(),
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            texture.extent(),
        );
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        loop {
            self.context
                .device
                .poll(wgpu::PollType::Wait)
                .map_err(|err| GpuError::Operation(format!("device poll failed: {err}")))?;
            match receiver.try_recv() {
                Ok(result) => {
                    result.map_err(|err| {
                        GpuError::Operation(format!("failed to map readback buffer: {err}"))
                    })?;
                    break;
                }
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => {
                    return Err(GpuError::Operation(
                        "readback callback dropped before completing".into(),
                    ))
                }
            }
        }

        let mut pixels = Vec::with_capacity(row_bytes as usize * height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize) {
                pixels.extend_from_slice(&row[..row_bytes as usize]);
            }
        }
        readback.unmap();
        RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            GpuError::Operation(format!("readback of {handle} returned a short buffer"))
        })
    }

    fn present(
        &mut self,
        source: Option<TextureHandle>,
        stamp: FrameStamp,
    ) -> Result<(), GpuError> {
        let source = source.map(|handle| self.texture(handle)).transpose()?;
        let surface_size = self.context.surface_size();
        match &self.context.presenter {
            Presenter::Window { surface, .. } => {
                let frame = match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                        tracing::debug!("surface outdated; reconfiguring before present");
                        self.context.reconfigure();
                        surface.get_current_texture().map_err(|err| {
                            GpuError::Operation(format!("failed to acquire surface texture: {err}"))
                        })?
                    }
                    Err(err) => {
                        return Err(GpuError::Operation(format!(
                            "failed to acquire surface texture: {err}"
                        )))
                    }
                };
                let view = frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.blit_to(&view, source, surface_size);
                frame.present();
            }
            Presenter::Offscreen { view, .. } => self.blit_to(view, source, surface_size),
        }
        tracing::trace!(
            generation = stamp.generation,
            quality = ?stamp.quality,
            "frame presented"
        );
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        check_dimensions(width, height, self.limits())?;
        self.context.resize(width, height);
        Ok(())
    }

    fn live_textures(&self) -> usize {
        self.textures.len()
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        for (_, texture) in self.textures.drain() {
            texture.texture.destroy();
        }
    }
}
