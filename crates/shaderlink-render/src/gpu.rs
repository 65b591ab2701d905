use anyhow::{Context, Result};
use std::collections::HashMap;
use wgpu::{
    Adapter, Device, Extent3d, Instance, Queue, Texture, TextureDescriptor, TextureFormat,
    TextureUsages,
};

#[derive(Hash, Eq, PartialEq, Clone, Copy)]
struct TextureDescKey {
    width: u32,
    height: u32,
    format: TextureFormat,
    usage: TextureUsages,
}

/// Render targets kept between frames, keyed by size, format and usage.
///
/// Benchmarks render the same size hundreds of times; reusing the target
/// avoids an allocation per frame.
#[derive(Default)]
pub struct TexturePool {
    free_textures: HashMap<TextureDescKey, Vec<Texture>>,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &mut self,
        device: &Device,
        label: Option<&str>,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsages,
    ) -> Texture {
        let key = TextureDescKey {
            width,
            height,
            format,
            usage,
        };

        if let Some(texture) = self.free_textures.get_mut(&key).and_then(Vec::pop) {
            return texture;
        }

        device.create_texture(&TextureDescriptor {
            label,
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    pub fn release(&mut self, texture: Texture) {
        let key = TextureDescKey {
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
            usage: texture.usage(),
        };
        self.free_textures.entry(key).or_default().push(texture);
    }

    /// Number of idle textures across all keys.
    pub fn idle(&self) -> usize {
        self.free_textures.values().map(Vec::len).sum()
    }
}

fn power_preference(name: &str) -> wgpu::PowerPreference {
    match name {
        "low" => wgpu::PowerPreference::LowPower,
        "none" => wgpu::PowerPreference::None,
        _ => wgpu::PowerPreference::HighPerformance,
    }
}

/// Headless GPU device owned by the engine thread.
pub struct GpuContext {
    pub instance: Instance,
    pub adapter: Adapter,
    pub device: Device,
    pub queue: Queue,
    pub texture_pool: TexturePool,
}

impl GpuContext {
    /// Initializes WGPU on the best available backend. `power` is `"high"`,
    /// `"low"` or `"none"`.
    pub fn init(power: &str) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: power_preference(power),
            compatible_surface: None, // Headless rendering
            force_fallback_adapter: false,
        }))
        .context("no suitable wgpu adapter")?;

        let info = adapter.get_info();
        tracing::info!("GPU adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Shaderlink Headless GPU Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            },
            None,
        ))
        .context("failed to open wgpu device")?;

        // Errors outside an error scope would otherwise panic the engine thread.
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!("uncaptured GPU error: {}", error);
        }));

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            texture_pool: TexturePool::new(),
        })
    }
}
