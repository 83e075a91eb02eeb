//! The render worker: sole owner of the device and every texture on it.
//!
//! Requests are drained into a local queue before each one is handled and
//! again between layers, so the worker always knows the newest render
//! generation it has been asked for. Renders older than that are dropped
//! without a response, whether they are still queued or half drawn.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use renderconfig::PipelineConfig;
use scheduler::ErrorCode;

use crate::composite::LayerObserver;
use crate::context::{FrameOutcome, PipelineContext};
use crate::gpu::{GpuBackend, GpuError, SoftwareBackend, WgpuBackend};
use crate::protocol::{
    FilterJob, RenderJob, Request, RequestBody, RequestId, Response, ResponseData, SurfaceTarget,
};
use crate::token::GenerationTracker;
use crate::types::Quality;
use crate::validate::ParamValidator;

/// Requests received but not yet handled, plus the generations they carry.
struct Mailbox {
    inbox: Receiver<Request>,
    pending: VecDeque<Request>,
    tracker: GenerationTracker,
    disconnected: bool,
}

impl Mailbox {
    fn absorb(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(request) => self.enqueue(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
    }

    fn enqueue(&mut self, request: Request) {
        match &request.body {
            RequestBody::Render(job) => {
                self.tracker.observe(job.token.generation);
            }
            RequestBody::Cancel { generation } => {
                tracing::debug!(generation, "render generation withdrawn");
                self.tracker.retire(*generation);
                return;
            }
            _ => {}
        }
        self.pending.push_back(request);
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.tracker.is_stale(generation)
    }
}

fn reply(outbox: &Sender<Response>, response: Response) {
    if outbox.send(response).is_err() {
        tracing::debug!("response receiver dropped");
    }
}

fn reply_error(outbox: &Sender<Response>, id: RequestId, err: &GpuError) {
    reply(
        outbox,
        Response::Error {
            id,
            code: err.code(),
            message: err.to_string(),
        },
    );
}

/// Reports per-layer progress and notices newer generations mid-frame.
struct FrameWatch<'a> {
    mailbox: &'a mut Mailbox,
    outbox: &'a Sender<Response>,
    /// `None` for silent refinement passes.
    id: Option<RequestId>,
    generation: u64,
    last_percent: u8,
}

impl LayerObserver for FrameWatch<'_> {
    fn progress(&mut self, done: usize, total: usize) {
        let Some(id) = self.id else {
            return;
        };
        self.mailbox.absorb();
        if self.mailbox.is_stale(self.generation) {
            return;
        }
        let percent = (done * 100 / total.max(1)).min(100) as u8;
        if percent > self.last_percent {
            self.last_percent = percent;
            reply(self.outbox, Response::Progress { id, percent });
        }
    }

    fn should_abandon(&mut self) -> bool {
        self.mailbox.absorb();
        self.mailbox.is_stale(self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Handled,
    Refined,
    Idle,
    Stopped,
}

pub struct Worker {
    mailbox: Mailbox,
    outbox: Sender<Response>,
    config: PipelineConfig,
    validator: Arc<dyn ParamValidator>,
    context: Option<PipelineContext>,
    refine: Option<RenderJob>,
}

impl Worker {
    pub fn new(
        inbox: Receiver<Request>,
        outbox: Sender<Response>,
        config: PipelineConfig,
        validator: Arc<dyn ParamValidator>,
    ) -> Self {
        Self {
            mailbox: Mailbox {
                inbox,
                pending: VecDeque::new(),
                tracker: GenerationTracker::default(),
                disconnected: false,
            },
            outbox,
            config,
            validator,
            context: None,
            refine: None,
        }
    }

    /// Serves requests until `Shutdown` arrives or every sender is gone.
    pub fn run(mut self) {
        loop {
            match self.step() {
                Step::Stopped => break,
                Step::Idle => match self.mailbox.inbox.recv() {
                    Ok(request) => self.mailbox.enqueue(request),
                    Err(_) => break,
                },
                Step::Handled | Step::Refined => {}
            }
        }
        self.stop();
    }

    /// Handles everything already queued, including pending refinement,
    /// without blocking. Returns false once the worker has stopped.
    pub fn run_until_idle(&mut self) -> bool {
        loop {
            match self.step() {
                Step::Idle => return true,
                Step::Stopped => {
                    self.stop();
                    return false;
                }
                Step::Handled | Step::Refined => {}
            }
        }
    }

    fn step(&mut self) -> Step {
        self.mailbox.absorb();
        if let Some(request) = self.mailbox.pending.pop_front() {
            return if self.handle(request) {
                Step::Handled
            } else {
                Step::Stopped
            };
        }
        if self.mailbox.disconnected {
            return Step::Stopped;
        }
        if let Some(job) = self.refine.take() {
            self.refine_draft(job);
            return Step::Refined;
        }
        Step::Idle
    }

    fn handle(&mut self, request: Request) -> bool {
        let Request { id, body } = request;
        tracing::debug!(%id, kind = body.name(), "handling request");
        match body {
            RequestBody::Initialize {
                surface,
                width,
                height,
            } => self.initialize(id, surface, width, height),
            RequestBody::Render(job) => self.render(id, job),
            RequestBody::ApplyFilter(job) => self.apply_filter(id, &job),
            RequestBody::Resize { width, height } => self.resize(id, width, height),
            RequestBody::Cancel { generation } => self.mailbox.tracker.retire(generation),
            RequestBody::Shutdown => return false,
        }
        true
    }

    fn initialize(&mut self, id: RequestId, surface: SurfaceTarget, width: u32, height: u32) {
        if self.context.is_some() {
            reply(
                &self.outbox,
                Response::Error {
                    id,
                    code: ErrorCode::Init,
                    message: "render worker is already initialised".into(),
                },
            );
            return;
        }
        tracing::info!(%id, ?surface, width, height, "initialising render worker");
        match open_backend(surface, width, height) {
            Ok(backend) => {
                let kind = backend.kind();
                let limits = backend.limits();
                self.context = Some(PipelineContext::new(
                    backend,
                    &self.config,
                    self.validator.clone(),
                ));
                tracing::info!(
                    ?kind,
                    max_texture_dimension = limits.max_texture_dimension,
                    "render worker ready"
                );
                reply(
                    &self.outbox,
                    Response::Success {
                        id,
                        data: ResponseData::Initialized {
                            backend: kind,
                            width,
                            height,
                            max_texture_dimension: limits.max_texture_dimension,
                        },
                    },
                );
            }
            Err(err) => {
                tracing::error!(%id, %err, "failed to initialise render worker");
                reply_error(&self.outbox, id, &err);
            }
        }
    }

    fn not_initialised(&self, id: RequestId) {
        reply(
            &self.outbox,
            Response::Error {
                id,
                code: ErrorCode::Init,
                message: "render worker is not initialised".into(),
            },
        );
    }

    fn render(&mut self, id: RequestId, job: RenderJob) {
        let generation = job.token.generation;
        if self.mailbox.is_stale(generation) {
            tracing::debug!(%id, generation, "skipping superseded render");
            return;
        }
        self.refine = None;
        let Some(context) = self.context.as_mut() else {
            self.not_initialised(id);
            return;
        };

        let quality = if job.interactive && context.progressive() {
            Quality::Draft
        } else {
            Quality::Full
        };
        let mut watch = FrameWatch {
            mailbox: &mut self.mailbox,
            outbox: &self.outbox,
            id: Some(id),
            generation,
            last_percent: 0,
        };
        match context.render_frame(&job, quality, &mut watch) {
            Ok(FrameOutcome::Presented(report)) => {
                for (layer, mode) in &report.fallbacks {
                    reply(
                        &self.outbox,
                        Response::Notice {
                            id,
                            code: ErrorCode::FallbackUsed,
                            message: format!("layer {layer}: blend mode {mode} drawn as normal"),
                        },
                    );
                }
                reply(
                    &self.outbox,
                    Response::Success {
                        id,
                        data: ResponseData::Rendered {
                            generation,
                            layers_drawn: report.layers_drawn,
                            quality,
                            sources: context.source_stats(),
                            masks: context.mask_stats(),
                        },
                    },
                );
                if quality == Quality::Draft {
                    self.refine = Some(job);
                }
            }
            Ok(FrameOutcome::Abandoned) => {
                tracing::debug!(%id, generation, "render superseded mid-frame");
            }
            Err(err) if self.mailbox.is_stale(generation) => {
                tracing::debug!(%id, generation, %err, "superseded render failed; not reported");
            }
            Err(err) => {
                tracing::warn!(%id, generation, %err, "render failed");
                reply_error(&self.outbox, id, &err);
            }
        }
    }

    fn refine_draft(&mut self, job: RenderJob) {
        let generation = job.token.generation;
        if self.mailbox.is_stale(generation) {
            return;
        }
        let Some(context) = self.context.as_mut() else {
            return;
        };
        let mut watch = FrameWatch {
            mailbox: &mut self.mailbox,
            outbox: &self.outbox,
            id: None,
            generation,
            last_percent: 0,
        };
        match context.render_frame(&job, Quality::Full, &mut watch) {
            Ok(FrameOutcome::Presented(_)) => tracing::debug!(generation, "refined draft frame"),
            Ok(FrameOutcome::Abandoned) => tracing::debug!(generation, "refinement superseded"),
            Err(err) => tracing::warn!(generation, %err, "refinement failed"),
        }
    }

    fn apply_filter(&mut self, id: RequestId, job: &FilterJob) {
        let Some(context) = self.context.as_mut() else {
            self.not_initialised(id);
            return;
        };
        match context.apply_filter(job) {
            Ok(image) => reply(
                &self.outbox,
                Response::Success {
                    id,
                    data: ResponseData::Filtered {
                        layer_id: job.layer_id,
                        image,
                    },
                },
            ),
            Err(err) => {
                tracing::warn!(%id, filter = job.filter.name(), %err, "filter failed");
                reply_error(&self.outbox, id, &err);
            }
        }
    }

    fn resize(&mut self, id: RequestId, width: u32, height: u32) {
        let Some(context) = self.context.as_mut() else {
            self.not_initialised(id);
            return;
        };
        match context.resize(width, height) {
            Ok(()) => reply(
                &self.outbox,
                Response::Success {
                    id,
                    data: ResponseData::Resized { width, height },
                },
            ),
            Err(err) => reply_error(&self.outbox, id, &err),
        }
    }

    fn stop(&mut self) {
        self.refine = None;
        if let Some(mut context) = self.context.take() {
            context.teardown();
        }
        tracing::info!("render worker stopped");
    }
}

fn open_backend(
    surface: SurfaceTarget,
    width: u32,
    height: u32,
) -> Result<Box<dyn GpuBackend>, GpuError> {
    let backend: Box<dyn GpuBackend> = match surface {
        SurfaceTarget::Memory(sink) => Box::new(SoftwareBackend::new(width, height, Some(sink))?),
        SurfaceTarget::Offscreen => Box::new(WgpuBackend::headless(width, height)?),
        SurfaceTarget::Window(window) => Box::new(WgpuBackend::for_window(window, width, height)?),
    };
    Ok(backend)
}
