//! Channel plumbing between the scheduler side and the worker thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use renderconfig::PipelineConfig;

use crate::protocol::{Request, RequestBody, RequestId, Response};
use crate::validate::ParamValidator;
use crate::worker::Worker;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("render worker is no longer running")]
    Disconnected,
    #[error("the surface has already been handed to the render worker")]
    AlreadyInitialized,
}

/// Scheduler-side endpoint. Assigns request ids and filters responses down to
/// requests that are still outstanding.
pub struct RenderClient {
    requests: Sender<Request>,
    responses: Receiver<Response>,
    next_id: u64,
    outstanding: HashMap<RequestId, &'static str>,
    surface_sent: bool,
    disconnected: bool,
}

impl RenderClient {
    fn new(requests: Sender<Request>, responses: Receiver<Response>) -> Self {
        Self {
            requests,
            responses,
            next_id: 1,
            outstanding: HashMap::new(),
            surface_sent: false,
            disconnected: false,
        }
    }

    /// Posts `body` to the worker. The surface can be transferred only once;
    /// a second `Initialize` is refused without reaching the worker.
    pub fn send(&mut self, body: RequestBody) -> Result<RequestId, TransportError> {
        let is_initialize = matches!(body, RequestBody::Initialize { .. });
        if is_initialize && self.surface_sent {
            return Err(TransportError::AlreadyInitialized);
        }
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let kind = body.name();
        self.post(Request { id, body })?;
        if is_initialize {
            self.surface_sent = true;
        }
        self.outstanding.insert(id, kind);
        tracing::trace!(%id, kind, "request posted");
        Ok(id)
    }

    /// Tells the worker to drop `generation` if it is still queued or being
    /// drawn. Nothing is tracked; the worker does not answer.
    pub fn cancel_generation(&mut self, generation: u64) -> Result<(), TransportError> {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.post(Request {
            id,
            body: RequestBody::Cancel { generation },
        })?;
        tracing::trace!(%id, generation, "render generation withdrawn");
        Ok(())
    }

    fn post(&mut self, request: Request) -> Result<(), TransportError> {
        self.requests.send(request).map_err(|_| {
            self.disconnected = true;
            TransportError::Disconnected
        })
    }

    /// Whether the worker side of the channel is still connected.
    pub fn is_connected(&self) -> bool {
        !self.disconnected
    }

    /// Stops tracking `id`; later responses for it are dropped.
    pub fn forget(&mut self, id: RequestId) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, id: RequestId) -> bool {
        self.outstanding.contains_key(&id)
    }

    fn accept(&mut self, response: Response) -> Option<Response> {
        let id = response.id();
        if !self.outstanding.contains_key(&id) {
            tracing::debug!(%id, "dropping response for a request that is not outstanding");
            return None;
        }
        if response.is_terminal() {
            self.outstanding.remove(&id);
        }
        Some(response)
    }

    /// Next response for an outstanding request, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Response> {
        loop {
            match self.responses.try_recv() {
                Ok(response) => {
                    if let Some(response) = self.accept(response) {
                        return Some(response);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    return None;
                }
            }
        }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) => {
                    if let Some(response) = self.accept(response) {
                        return Some(response);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.disconnected = true;
                    return None;
                }
            }
        }
    }
}

/// Owns the worker thread. Dropping it shuts the worker down.
pub struct WorkerHandle {
    requests: Sender<Request>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        config: PipelineConfig,
        validator: Arc<dyn ParamValidator>,
    ) -> Result<(RenderClient, WorkerHandle)> {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("render-worker".into())
            .spawn(move || {
                let worker = Worker::new(request_rx, response_tx, config, validator);
                let _ = ready_tx.send(());
                worker.run();
            })
            .map_err(|err| anyhow!("failed to spawn render worker: {err}"))?;

        ready_rx
            .recv()
            .map_err(|err| anyhow!("render worker failed to start: {err}"))?;

        Ok((
            RenderClient::new(request_tx.clone(), response_rx),
            WorkerHandle {
                requests: request_tx,
                join_handle: Some(handle),
            },
        ))
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.join_handle.take() {
            let _ = self.requests.send(Request {
                id: RequestId(0),
                body: RequestBody::Shutdown,
            });
            handle
                .join()
                .map_err(|err| anyhow!("render worker panicked: {err:?}"))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
