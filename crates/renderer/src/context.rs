use std::collections::HashSet;
use std::sync::Arc;

use image::RgbaImage;
use renderconfig::{PipelineConfig, RenderConfig};

use crate::cache::{CacheStats, TextureCache};
use crate::composite::{Composite, CompositeReport, LayerObserver};
use crate::gpu::{BackendKind, BackendLimits, FrameStamp, GpuBackend, GpuError};
use crate::passes::PassEnv;
use crate::pool::{PingPong, PoolStats, ResourcePool};
use crate::protocol::{FilterJob, RenderJob};
use crate::types::{CanvasParams, LayerId, Quality};
use crate::validate::ParamValidator;

/// Outcome of one render request on the worker.
#[derive(Debug)]
pub enum FrameOutcome {
    Presented(CompositeReport),
    /// A newer generation arrived mid-frame; nothing was presented.
    Abandoned,
}

/// Everything the worker owns for the lifetime of one device.
pub struct PipelineContext {
    pub(crate) backend: Box<dyn GpuBackend>,
    pub(crate) pool: ResourcePool,
    pub(crate) sources: TextureCache,
    pub(crate) masks: TextureCache,
    pub(crate) ping_pong: Option<PingPong>,
    pub(crate) validator: Arc<dyn ParamValidator>,
    config: RenderConfig,
}

impl PipelineContext {
    pub fn new(
        backend: Box<dyn GpuBackend>,
        config: &PipelineConfig,
        validator: Arc<dyn ParamValidator>,
    ) -> Self {
        Self {
            backend,
            pool: ResourcePool::new(&config.resource_pool),
            sources: TextureCache::new("sources", &config.texture_cache),
            masks: TextureCache::new("masks", &config.texture_cache),
            ping_pong: None,
            validator,
            config: config.render.clone(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn limits(&self) -> BackendLimits {
        self.backend.limits()
    }

    pub fn progressive(&self) -> bool {
        self.config.progressive
    }

    pub fn source_stats(&self) -> CacheStats {
        self.sources.stats()
    }

    pub fn mask_stats(&self) -> CacheStats {
        self.masks.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let limits = self.backend.limits();
        self.validator
            .dimensions(width, height, &limits)
            .map_err(|reason| {
                tracing::debug!(width, height, %reason, "rejected dimensions");
                GpuError::Dimension {
                    width,
                    height,
                    max: limits.max_texture_dimension,
                }
            })
    }

    pub(crate) fn ensure_ping_pong(&mut self, canvas: CanvasParams) -> Result<(), GpuError> {
        match self.ping_pong.as_mut() {
            Some(pair) => pair.ensure_size(self.backend.as_mut(), canvas.width, canvas.height),
            None => {
                let pair = PingPong::new(self.backend.as_mut(), canvas.width, canvas.height)?;
                self.ping_pong = Some(pair);
                Ok(())
            }
        }
    }

    /// Composites and presents one render job. The caches are swept against
    /// the job's layers whether the frame was presented, abandoned or failed.
    pub fn render_frame(
        &mut self,
        job: &RenderJob,
        quality: Quality,
        observer: &mut dyn LayerObserver,
    ) -> Result<FrameOutcome, GpuError> {
        let outcome = self.draw_frame(job, quality, observer);
        self.sweep(job, job.token.generation);
        outcome
    }

    fn draw_frame(
        &mut self,
        job: &RenderJob,
        quality: Quality,
        observer: &mut dyn LayerObserver,
    ) -> Result<FrameOutcome, GpuError> {
        let generation = job.token.generation;
        self.check_dimensions(job.canvas.width, job.canvas.height)?;

        let report = match self.composite(&job.layers, job.canvas, generation, quality, observer)? {
            Composite::Done(report) => report,
            Composite::Abandoned => return Ok(FrameOutcome::Abandoned),
        };
        if observer.should_abandon() {
            return Ok(FrameOutcome::Abandoned);
        }

        self.backend
            .present(report.result, FrameStamp { generation, quality })?;
        tracing::debug!(
            generation,
            ?quality,
            layers = report.layers_drawn,
            "presented frame"
        );
        Ok(FrameOutcome::Presented(report))
    }

    fn sweep(&mut self, job: &RenderJob, generation: u64) {
        let live: HashSet<LayerId> = job.layers.iter().map(|layer| layer.id).collect();
        let masked: HashSet<LayerId> = job
            .layers
            .iter()
            .filter(|layer| layer.mask.is_some())
            .map(|layer| layer.id)
            .collect();
        self.sources
            .sweep(self.backend.as_mut(), &live, generation);
        self.masks.sweep(self.backend.as_mut(), &masked, generation);
    }

    /// Runs one filter over a detached image and reads the result back.
    pub fn apply_filter(&mut self, job: &FilterJob) -> Result<RgbaImage, GpuError> {
        self.check_dimensions(job.source.width(), job.source.height())?;
        let source = self.backend.upload(&job.source)?;
        let filtered = PassEnv {
            backend: self.backend.as_mut(),
            pool: &mut self.pool,
            validator: self.validator.as_ref(),
        }
        .apply_filter(source, &job.filter);
        self.backend.destroy(source);

        let target = filtered?;
        let image = self.backend.read_back(target.handle);
        self.pool.give_back(self.backend.as_mut(), target);
        image
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        self.check_dimensions(width, height)?;
        self.backend.resize_surface(width, height)
    }

    /// Releases every texture the context still holds.
    pub fn teardown(&mut self) {
        if let Some(pair) = self.ping_pong.take() {
            pair.destroy(self.backend.as_mut());
        }
        self.sources.clear(self.backend.as_mut());
        self.masks.clear(self.backend.as_mut());
        self.pool.clear(self.backend.as_mut());
        tracing::debug!(live = self.backend.live_textures(), "pipeline context torn down");
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
