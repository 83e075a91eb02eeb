//! Worker side of the layered compositing service.
//!
//! A single worker thread owns the GPU backend, the render target pool, the
//! source/mask texture caches and the ping-pong composite pair. The scheduler
//! side talks to it only through messages:
//!
//! ```text
//!   RenderClient ──Request──▶ Worker ──▶ PipelineContext::render_frame()
//!        ▲                      │               │
//!        │                      │               ├─▶ passes (place, blur, stylize, tone)
//!        └──────Response────────┘               └─▶ composite (blend, swap) ─▶ present
//! ```
//!
//! Every render carries a [`RenderToken`]. The worker keeps the highest
//! generation it has seen and drops work that a newer request superseded
//! before it can emit progress, a result, or a frame.

mod cache;
pub mod color;
mod compile;
mod composite;
mod context;
pub mod gpu;
mod passes;
mod pool;
mod protocol;
mod token;
mod transport;
mod types;
mod validate;
mod worker;

pub use cache::{CacheStats, TextureCache};
pub use composite::{Composite, CompositeReport, LayerObserver, Unobserved};
pub use context::{FrameOutcome, PipelineContext};
pub use gpu::{
    BackendKind, BackendLimits, GpuBackend, GpuError, SoftwareBackend, TextureHandle, TraceLog,
    TraceOp, WgpuBackend,
};
pub use pool::{PingPong, PoolStats, PooledTarget, ResourcePool};
pub use protocol::{
    FilterJob, FrameSink, PresentedFrame, RenderJob, Request, RequestBody, RequestId, Response,
    ResponseData, SurfaceTarget, WindowSurface,
};
pub use token::{signature, GenerationTracker, RenderToken, TokenIssuer};
pub use transport::{RenderClient, TransportError, WorkerHandle};
pub use types::*;
pub use validate::{LimitsValidator, ParamValidator};
pub use worker::Worker;
