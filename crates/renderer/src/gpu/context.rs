use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::protocol::WindowSurface;

/// Format of every texture the pipeline renders into.
pub(crate) const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Where presented frames land.
pub(crate) enum Presenter {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        // Declared after `surface` so the window outlives it.
        _window: Arc<dyn WindowSurface>,
    },
    Offscreen {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        size: (u32, u32),
    },
}

pub(crate) struct GpuContext {
    _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub presenter: Presenter,
    pub surface_format: wgpu::TextureFormat,
    pub max_texture_dimension: u32,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

fn request_device(
    instance: &wgpu::Instance,
    compatible_surface: Option<&wgpu::Surface<'_>>,
) -> Result<(wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface,
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")?;

    let info = adapter.get_info();
    tracing::debug!(
        name = %info.name,
        backend = ?info.backend,
        device_type = ?info.device_type,
        "selected GPU adapter"
    );

    let limits = adapter.limits();
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("layer pipeline device"),
        required_features: wgpu::Features::empty(),
        required_limits: limits,
        memory_hints: wgpu::MemoryHints::Performance,
        trace: wgpu::Trace::default(),
    }))
    .context("failed to create GPU device")?;
    Ok((adapter, device, queue))
}

fn check_size(width: u32, height: u32, max_dimension: u32) -> Result<()> {
    if width == 0 || height == 0 || width > max_dimension || height > max_dimension {
        anyhow::bail!(
            "GPU max texture dimension is {max_dimension}, requested surface is {width}x{height}"
        );
    }
    Ok(())
}

fn offscreen_target(device: &wgpu::Device, width: u32, height: u32) -> Presenter {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("offscreen surface"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Presenter::Offscreen {
        texture,
        view,
        size: (width, height),
    }
}

impl GpuContext {
    pub(crate) fn for_window(window: Arc<dyn WindowSurface>, width: u32, height: u32) -> Result<Self> {
        let instance = instance();

        let window_handle = window
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = window
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;

        // SAFETY: the presenter keeps `window` alive for as long as the surface.
        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let (adapter, device, queue) = request_device(&instance, Some(&surface))?;
        let max_texture_dimension = device.limits().max_texture_dimension_2d;
        check_size(width, height, max_texture_dimension)?;

        let caps = surface.get_capabilities(&adapter);
        // Texel values are already display-encoded; avoid a second sRGB encode.
        let surface_format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no supported formats"))?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        tracing::debug!(?surface_format, width, height, "configured window surface");

        Ok(Self {
            _instance: instance,
            device,
            queue,
            presenter: Presenter::Window {
                surface,
                config,
                _window: window,
            },
            surface_format,
            max_texture_dimension,
        })
    }

    pub(crate) fn headless(width: u32, height: u32) -> Result<Self> {
        let instance = instance();
        let (_adapter, device, queue) = request_device(&instance, None)?;
        let max_texture_dimension = device.limits().max_texture_dimension_2d;
        check_size(width, height, max_texture_dimension)?;
        let presenter = offscreen_target(&device, width, height);
        Ok(Self {
            _instance: instance,
            device,
            queue,
            presenter,
            surface_format: TARGET_FORMAT,
            max_texture_dimension,
        })
    }

    pub(crate) fn surface_size(&self) -> (u32, u32) {
        match &self.presenter {
            Presenter::Window { config, .. } => (config.width, config.height),
            Presenter::Offscreen { size, .. } => *size,
        }
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        match &mut self.presenter {
            Presenter::Window {
                surface, config, ..
            } => {
                config.width = width;
                config.height = height;
                surface.configure(&self.device, config);
            }
            Presenter::Offscreen { texture, .. } => {
                texture.destroy();
                self.presenter = offscreen_target(&self.device, width, height);
            }
        }
    }

    /// Re-applies the current configuration after the surface was lost.
    pub(crate) fn reconfigure(&self) {
        if let Presenter::Window {
            surface, config, ..
        } = &self.presenter
        {
            surface.configure(&self.device, config);
        }
    }
}
