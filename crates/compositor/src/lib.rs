//! Main-thread facade over the scheduler and the render worker.
//!
//! [`RenderService`] owns a [`TaskScheduler`], the transport client and the
//! worker thread. Callers submit work and get a [`TaskId`] back immediately;
//! everything else arrives as [`ServiceEvent`]s from [`RenderService::pump`]
//! (non-blocking) or [`RenderService::wait`] (blocking up to a timeout).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use image::RgbaImage;
use renderconfig::PipelineConfig;
use renderer::{
    CanvasParams, Filter, FilterJob, LayerId, LayerParams, LimitsValidator, ParamValidator,
    RenderClient, RenderJob, RequestBody, RequestId, Response, ResponseData, SurfaceTarget,
    TokenIssuer, TransportError, WorkerHandle,
};
use scheduler::{
    Dispatch, ErrorCode, FailureResolution, Health, Priority, QueueSnapshot, Resolution,
    SchedulerEvent, TaskFailure, TaskId, TaskKind, TaskRequest, TaskScheduler,
};
use tracing_subscriber::EnvFilter;

pub use renderer;
pub use scheduler;

/// Installs a `fmt` subscriber honouring `RUST_LOG`, defaulting to `info`.
pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Work carried by a scheduled task until it is handed to the worker.
#[derive(Debug, Clone)]
pub enum Payload {
    Initialize {
        surface: SurfaceTarget,
        width: u32,
        height: u32,
    },
    Render(RenderJob),
    Filter(FilterJob),
    Resize {
        width: u32,
        height: u32,
    },
}

impl Payload {
    fn into_request(self) -> RequestBody {
        match self {
            Payload::Initialize {
                surface,
                width,
                height,
            } => RequestBody::Initialize {
                surface,
                width,
                height,
            },
            Payload::Render(job) => RequestBody::Render(job),
            Payload::Filter(job) => RequestBody::ApplyFilter(job),
            Payload::Resize { width, height } => RequestBody::Resize { width, height },
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Progress {
        id: TaskId,
        percent: u8,
    },
    /// Informational; the task keeps running.
    Notice {
        id: TaskId,
        code: ErrorCode,
        message: String,
    },
    Completed {
        id: TaskId,
        data: ResponseData,
    },
    Retrying {
        id: TaskId,
        next_attempt: u32,
        delay: Duration,
        failure: TaskFailure,
    },
    Failed {
        id: TaskId,
        failure: TaskFailure,
    },
    /// A newer render superseded this one; no result will follow.
    Preempted {
        id: TaskId,
    },
    Cancelled {
        id: TaskId,
    },
    /// The attempt missed its deadline. A `Retrying` or `Failed` follows.
    TimedOut {
        id: TaskId,
        attempt: u32,
    },
}

impl ServiceEvent {
    pub fn id(&self) -> TaskId {
        match self {
            ServiceEvent::Progress { id, .. }
            | ServiceEvent::Notice { id, .. }
            | ServiceEvent::Completed { id, .. }
            | ServiceEvent::Retrying { id, .. }
            | ServiceEvent::Failed { id, .. }
            | ServiceEvent::Preempted { id }
            | ServiceEvent::Cancelled { id }
            | ServiceEvent::TimedOut { id, .. } => *id,
        }
    }

    /// Whether no further events will be emitted for this task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceEvent::Completed { .. }
                | ServiceEvent::Failed { .. }
                | ServiceEvent::Preempted { .. }
                | ServiceEvent::Cancelled { .. }
        )
    }
}

/// The task attempt a worker request carries.
#[derive(Debug, Clone, Copy)]
struct Posted {
    task: TaskId,
    attempt: u32,
    generation: Option<u64>,
}

pub struct RenderService {
    scheduler: TaskScheduler<Payload>,
    client: RenderClient,
    worker: Option<WorkerHandle>,
    tokens: TokenIssuer,
    requests: HashMap<RequestId, Posted>,
    pending: Vec<ServiceEvent>,
}

impl RenderService {
    pub fn spawn(config: PipelineConfig) -> Result<Self> {
        let validator = Arc::new(LimitsValidator::new(&config.render));
        Self::spawn_with_validator(config, validator)
    }

    pub fn spawn_with_validator(
        config: PipelineConfig,
        validator: Arc<dyn ParamValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let scheduler = TaskScheduler::new(&config.scheduler, seed);
        let (client, worker) = WorkerHandle::spawn(config, validator)?;
        tracing::info!("render service started");
        Ok(Self {
            scheduler,
            client,
            worker: Some(worker),
            tokens: TokenIssuer::new(),
            requests: HashMap::new(),
            pending: Vec::new(),
        })
    }

    /// Hands the presentation surface to the worker. Never retried.
    pub fn initialize(&mut self, surface: SurfaceTarget, width: u32, height: u32) -> TaskId {
        let request = TaskRequest::new(
            TaskKind::Initialize,
            Priority::Critical,
            Payload::Initialize {
                surface,
                width,
                height,
            },
        )
        .with_max_retries(0);
        self.scheduler.submit(request, Instant::now())
    }

    /// Queues a composite of `layers` (top-most first). Interactive renders
    /// are dispatched ahead of background ones and present a draft first.
    pub fn render(
        &mut self,
        layers: Vec<LayerParams>,
        canvas: CanvasParams,
        interactive: bool,
    ) -> TaskId {
        let token = self.tokens.issue(&layers, canvas);
        let generation = token.generation;
        let priority = if interactive {
            Priority::High
        } else {
            Priority::Medium
        };
        let job = RenderJob {
            layers: Arc::new(layers),
            canvas,
            token,
            interactive,
        };
        let request =
            TaskRequest::new(TaskKind::Render, priority, Payload::Render(job)).with_generation(generation);
        let id = self.scheduler.submit(request, Instant::now());
        tracing::debug!(%id, generation, interactive, "render submitted");
        id
    }

    pub fn apply_filter(
        &mut self,
        layer_id: LayerId,
        filter: Filter,
        source: Arc<RgbaImage>,
    ) -> TaskId {
        let job = FilterJob {
            layer_id,
            filter,
            source,
        };
        let request = TaskRequest::new(TaskKind::Filter, Priority::High, Payload::Filter(job));
        self.scheduler.submit(request, Instant::now())
    }

    pub fn resize(&mut self, width: u32, height: u32) -> TaskId {
        let request = TaskRequest::new(
            TaskKind::Resize,
            Priority::High,
            Payload::Resize { width, height },
        );
        self.scheduler.submit(request, Instant::now())
    }

    /// Cancels a queued or in-flight task. A late result is discarded, and an
    /// in-flight render is withdrawn so the worker never presents it.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let generation = self
            .requests
            .values()
            .find(|posted| posted.task == id)
            .and_then(|posted| posted.generation);
        if !self.scheduler.cancel(id) {
            return false;
        }
        if let Some(generation) = generation {
            if let Err(err) = self.client.cancel_generation(generation) {
                tracing::debug!(%id, generation, %err, "could not withdraw render");
            }
        }
        self.forget_task(id);
        self.pending.push(ServiceEvent::Cancelled { id });
        true
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.scheduler.snapshot()
    }

    pub fn health(&self) -> Health {
        self.scheduler.health()
    }

    /// True when nothing is queued, backing off, or in flight.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && self.pending.is_empty()
    }

    /// Applies queued worker responses, advances scheduler timers and
    /// dispatches whatever the lanes allow. Never blocks.
    pub fn pump(&mut self, now: Instant) -> Vec<ServiceEvent> {
        let mut events = std::mem::take(&mut self.pending);
        while let Some(response) = self.client.try_recv() {
            self.handle_response(response, now, &mut events);
        }
        if !self.client.is_connected() {
            self.fail_outstanding(now, &mut events);
        }
        self.advance(now, &mut events);
        events
    }

    /// Like [`pump`](Self::pump), but blocks up to `timeout` until at least
    /// one event is available. Returns early once the worker has gone away.
    pub fn wait(&mut self, timeout: Duration) -> Vec<ServiceEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let mut events = self.pump(now);
            if !events.is_empty() || now >= deadline || !self.client.is_connected() {
                return events;
            }
            let wake = self
                .scheduler
                .next_wakeup()
                .map_or(deadline, |wakeup| wakeup.min(deadline));
            if let Some(response) = self
                .client
                .recv_timeout(wake.saturating_duration_since(now))
            {
                let now = Instant::now();
                self.handle_response(response, now, &mut events);
                events.extend(self.pump(now));
                if !events.is_empty() {
                    return events;
                }
            }
        }
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.shutdown()?;
            tracing::info!("render service stopped");
        }
        Ok(())
    }

    fn advance(&mut self, now: Instant, events: &mut Vec<ServiceEvent>) {
        for event in self.scheduler.poll(now) {
            match event {
                SchedulerEvent::Dispatch(dispatch) => self.dispatch(dispatch, now, events),
                SchedulerEvent::TimedOut { id, attempt } => {
                    tracing::warn!(%id, attempt, "task timed out");
                    self.forget_task(id);
                    events.push(ServiceEvent::TimedOut { id, attempt });
                }
                SchedulerEvent::Retrying {
                    id,
                    next_attempt,
                    delay,
                    failure,
                } => events.push(ServiceEvent::Retrying {
                    id,
                    next_attempt,
                    delay,
                    failure,
                }),
                SchedulerEvent::Failed { id, failure } => {
                    events.push(ServiceEvent::Failed { id, failure })
                }
                SchedulerEvent::Preempted { id } => {
                    self.forget_task(id);
                    events.push(ServiceEvent::Preempted { id });
                }
            }
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch<Payload>, now: Instant, events: &mut Vec<ServiceEvent>) {
        let Dispatch {
            id,
            attempt,
            generation,
            payload,
            ..
        } = dispatch;
        match self.client.send(payload.into_request()) {
            Ok(request) => {
                tracing::debug!(%id, attempt, %request, "task dispatched");
                self.requests.insert(
                    request,
                    Posted {
                        task: id,
                        attempt,
                        generation,
                    },
                );
            }
            Err(err) => {
                if err == TransportError::Disconnected {
                    tracing::error!(%id, "render worker disconnected");
                }
                let failure = TaskFailure::new(ErrorCode::Init, err.to_string());
                let resolution = self.scheduler.fail(id, attempt, failure.clone(), now);
                Self::push_failure(id, failure, resolution, events);
            }
        }
    }

    fn handle_response(&mut self, response: Response, now: Instant, events: &mut Vec<ServiceEvent>) {
        let request = response.id();
        let Some(&Posted {
            task: id, attempt, ..
        }) = self.requests.get(&request)
        else {
            tracing::debug!(%request, "response for an untracked request dropped");
            return;
        };
        if response.is_terminal() {
            self.requests.remove(&request);
        }
        match response {
            Response::Progress { percent, .. } => {
                if self.scheduler.accepts_progress(id, attempt) {
                    events.push(ServiceEvent::Progress { id, percent });
                }
            }
            Response::Notice { code, message, .. } => {
                if self.scheduler.accepts_progress(id, attempt) {
                    events.push(ServiceEvent::Notice { id, code, message });
                }
            }
            Response::Success { data, .. } => match self.scheduler.complete(id, attempt) {
                Resolution::Accepted => events.push(ServiceEvent::Completed { id, data }),
                resolution => {
                    tracing::debug!(%id, attempt, ?resolution, "late result discarded");
                }
            },
            Response::Error { code, message, .. } => {
                let failure = TaskFailure::new(code, message);
                let resolution = self.scheduler.fail(id, attempt, failure.clone(), now);
                Self::push_failure(id, failure, resolution, events);
            }
        }
    }

    /// Fails every task still waiting on a worker that has gone away.
    fn fail_outstanding(&mut self, now: Instant, events: &mut Vec<ServiceEvent>) {
        for (request, posted) in std::mem::take(&mut self.requests) {
            tracing::error!(id = %posted.task, %request, "render worker exited mid-task");
            self.client.forget(request);
            let failure =
                TaskFailure::new(ErrorCode::Init, TransportError::Disconnected.to_string());
            let resolution = self
                .scheduler
                .fail(posted.task, posted.attempt, failure.clone(), now);
            Self::push_failure(posted.task, failure, resolution, events);
        }
    }

    fn push_failure(
        id: TaskId,
        failure: TaskFailure,
        resolution: FailureResolution,
        events: &mut Vec<ServiceEvent>,
    ) {
        match resolution {
            FailureResolution::Retrying {
                next_attempt,
                delay,
            } => events.push(ServiceEvent::Retrying {
                id,
                next_attempt,
                delay,
                failure,
            }),
            FailureResolution::Failed(failure) => events.push(ServiceEvent::Failed { id, failure }),
            FailureResolution::Discarded | FailureResolution::Stale => {
                tracing::debug!(%id, "failure for a task that is no longer current ignored");
            }
        }
    }

    fn forget_task(&mut self, id: TaskId) {
        let client = &mut self.client;
        self.requests.retain(|request, posted| {
            if posted.task == id {
                client.forget(*request);
                false
            } else {
                true
            }
        });
    }
}

impl Drop for RenderService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
