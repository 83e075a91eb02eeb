use std::fmt;
use std::time::Instant;

/// Dispatch urgency. Lower discriminant is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// One level more urgent; `Critical` stays `Critical`.
    pub fn boosted(self) -> Self {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Render,
    Filter,
    Initialize,
    Resize,
}

impl TaskKind {
    pub fn lane(self) -> Lane {
        match self {
            TaskKind::Filter => Lane::Filter,
            TaskKind::Render | TaskKind::Initialize | TaskKind::Resize => Lane::Render,
        }
    }
}

/// Independent execution slots. Filter work never waits behind a long render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Render,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What a caller hands to [`crate::TaskScheduler::submit`].
#[derive(Debug, Clone)]
pub struct TaskRequest<P> {
    pub kind: TaskKind,
    pub priority: Priority,
    pub payload: P,
    /// Overrides the scheduler-wide retry budget when set.
    pub max_retries: Option<u32>,
    /// Render generation; newer generations preempt older render tasks.
    pub generation: Option<u64>,
}

impl<P> TaskRequest<P> {
    pub fn new(kind: TaskKind, priority: Priority, payload: P) -> Self {
        Self {
            kind,
            priority,
            payload,
            max_retries: None,
            generation: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RenderTask<P> {
    pub id: TaskId,
    pub priority: Priority,
    pub kind: TaskKind,
    pub payload: P,
    pub created_at: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub generation: Option<u64>,
}

impl<P> RenderTask<P> {
    /// 1-based attempt number of the next (or current) dispatch.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Failure taxonomy shared by the scheduler and the render worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// GPU context or surface acquisition failed.
    Init,
    /// Requested dimensions exceed platform limits.
    Dimension,
    /// Texture or target allocation failed.
    Resource,
    /// A GPU operation failed mid-pipeline.
    Render,
    /// A secondary compositing path was used; the frame was still drawn.
    FallbackUsed,
    /// No terminal response arrived before the deadline.
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Init => "INIT_ERROR",
            ErrorCode::Dimension => "DIMENSION_ERROR",
            ErrorCode::Resource => "RESOURCE_ERROR",
            ErrorCode::Render => "RENDER_ERROR",
            ErrorCode::FallbackUsed => "FALLBACK_USED",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    /// Whether a failure with this code should consume the retry budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Resource | ErrorCode::Render | ErrorCode::Timeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TaskFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
