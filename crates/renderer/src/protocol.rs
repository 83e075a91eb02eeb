//! Messages exchanged between the scheduler thread and the render worker.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbaImage;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use scheduler::ErrorCode;

use crate::cache::CacheStats;
use crate::gpu::BackendKind;
use crate::token::RenderToken;
use crate::types::{CanvasParams, Filter, LayerId, LayerParams, Quality};

/// Correlates a request with every response the worker sends for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// A native window the worker may render into.
pub trait WindowSurface: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T> WindowSurface for T where T: HasWindowHandle + HasDisplayHandle + Send + Sync {}

/// A frame handed to a [`FrameSink`].
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub generation: u64,
    pub quality: Quality,
    pub image: RgbaImage,
}

/// In-memory presentation target. Each present delivers one frame.
#[derive(Debug, Clone)]
pub struct FrameSink {
    sender: Sender<PresentedFrame>,
}

impl FrameSink {
    pub fn channel() -> (Self, Receiver<PresentedFrame>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    /// Returns false when the receiving side is gone.
    pub(crate) fn deliver(&self, frame: PresentedFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Where composited frames end up. Ownership moves to the worker on
/// initialisation.
#[derive(Clone)]
pub enum SurfaceTarget {
    /// A native window rendered through `wgpu`.
    Window(Arc<dyn WindowSurface>),
    /// A headless `wgpu` device rendering into an offscreen texture.
    Offscreen,
    /// The CPU backend delivering frames to a channel.
    Memory(FrameSink),
}

impl fmt::Debug for SurfaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceTarget::Window(_) => f.write_str("Window"),
            SurfaceTarget::Offscreen => f.write_str("Offscreen"),
            SurfaceTarget::Memory(_) => f.write_str("Memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    /// UI order: the first entry is the top-most layer.
    pub layers: Arc<Vec<LayerParams>>,
    pub canvas: CanvasParams,
    pub token: RenderToken,
    /// Interactive renders present a draft first and refine when idle.
    pub interactive: bool,
}

#[derive(Debug, Clone)]
pub struct FilterJob {
    pub layer_id: LayerId,
    pub filter: Filter,
    pub source: Arc<RgbaImage>,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Initialize {
        surface: SurfaceTarget,
        width: u32,
        height: u32,
    },
    Render(RenderJob),
    ApplyFilter(FilterJob),
    Resize {
        width: u32,
        height: u32,
    },
    /// Withdraws a render generation. Never answered.
    Cancel {
        generation: u64,
    },
    Shutdown,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Initialize { .. } => "initialize",
            RequestBody::Render(_) => "render",
            RequestBody::ApplyFilter(_) => "apply_filter",
            RequestBody::Resize { .. } => "resize",
            RequestBody::Cancel { .. } => "cancel",
            RequestBody::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

#[derive(Debug, Clone)]
pub enum ResponseData {
    Initialized {
        backend: BackendKind,
        width: u32,
        height: u32,
        max_texture_dimension: u32,
    },
    Rendered {
        generation: u64,
        layers_drawn: usize,
        quality: Quality,
        sources: CacheStats,
        masks: CacheStats,
    },
    Filtered {
        layer_id: LayerId,
        image: RgbaImage,
    },
    Resized {
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone)]
pub enum Response {
    Progress {
        id: RequestId,
        percent: u8,
    },
    /// Informational, non-terminal. The frame is still drawn.
    Notice {
        id: RequestId,
        code: ErrorCode,
        message: String,
    },
    Success {
        id: RequestId,
        data: ResponseData,
    },
    Error {
        id: RequestId,
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn id(&self) -> RequestId {
        match self {
            Response::Progress { id, .. }
            | Response::Notice { id, .. }
            | Response::Success { id, .. }
            | Response::Error { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Success { .. } | Response::Error { .. })
    }
}
