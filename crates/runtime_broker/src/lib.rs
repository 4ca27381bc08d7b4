//! The per-function broker between external invocations and the container
//! instances that poll for them. One broker owns a bounded FIFO work queue
//! and an in-flight table keyed by request id; containers converse with it
//! over the runtime HTTP surface in [`server`].

use std::{
    collections::HashMap,
    sync::Arc,
};

use async_channel::TrySendError;
use bytes::Bytes;
use common::RequestId;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::oneshot;

mod context;
mod metrics;
pub mod server;

pub use context::{
    FunctionError,
    FunctionErrorKind,
    InvocationType,
    InvokeReply,
    LogType,
    RequestContext,
};
pub use server::RuntimeEndpoint;

pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

type ReplySlot = oneshot::Sender<Result<InvokeReply, ErrorMetadata>>;

struct QueuedInvocation {
    ctx: Arc<RequestContext>,
    reply: ReplySlot,
}

struct InFlightInvocation {
    #[allow(dead_code)]
    ctx: Arc<RequestContext>,
    reply: ReplySlot,
}

/// Handed back by [`RuntimeBroker::enqueue`]; the caller parks on it in
/// [`RuntimeBroker::await_reply`] or drops it for fire-and-forget flows.
#[derive(Debug)]
pub struct ReplyHandle {
    pub request_id: RequestId,
    deadline: tokio::time::Instant,
    rx: oneshot::Receiver<Result<InvokeReply, ErrorMetadata>>,
}

/// How a caller's wait on an invocation resolved.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// A container posted a payload or a function error.
    Completed(InvokeReply),
    /// The context deadline elapsed with no response. The in-flight entry
    /// has been removed; any later post for this id is rejected.
    TimedOut,
    /// The invocation was failed by the broker itself (function removed,
    /// process draining).
    Failed(ErrorMetadata),
}

pub struct RuntimeBroker {
    function_name: String,
    queue_tx: async_channel::Sender<QueuedInvocation>,
    queue_rx: async_channel::Receiver<QueuedInvocation>,
    in_flight: Mutex<HashMap<RequestId, InFlightInvocation>>,
    init_error: Mutex<Option<FunctionError>>,
}

impl RuntimeBroker {
    pub fn new(function_name: String, queue_capacity: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = async_channel::bounded(queue_capacity);
        Arc::new(Self {
            function_name,
            queue_tx,
            queue_rx,
            in_flight: Mutex::new(HashMap::new()),
            init_error: Mutex::new(None),
        })
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Push a context onto the work queue. Returns immediately; the caller
    /// keeps the handle to await completion. A full queue is the caller's
    /// backpressure signal.
    pub fn enqueue(&self, ctx: RequestContext) -> anyhow::Result<ReplyHandle> {
        let ctx = Arc::new(ctx);
        let (reply, rx) = oneshot::channel();
        let handle = ReplyHandle {
            request_id: ctx.request_id.clone(),
            deadline: ctx.deadline(),
            rx,
        };
        match self.queue_tx.try_send(QueuedInvocation { ctx, reply }) {
            Ok(()) => {
                metrics::log_enqueued();
                Ok(handle)
            },
            Err(TrySendError::Full(_)) => {
                metrics::log_queue_full();
                Err(ErrorMetadata::overloaded(
                    "TooBusy",
                    format!("Work queue for {} is full", self.function_name),
                )
                .into())
            },
            Err(TrySendError::Closed(_)) => Err(ErrorMetadata::shutdown(
                "FunctionShuttingDown",
                format!("{} is no longer accepting invocations", self.function_name),
            )
            .into()),
        }
    }

    /// Blocking poll issued by a container instance. Removes the head of
    /// the queue and registers it in the in-flight table before returning.
    /// Contexts whose caller already gave up (deadline elapsed or handle
    /// dropped) are discarded rather than handed out.
    ///
    /// Cancellation safety: if the polling connection closes, this future
    /// is dropped before an item has been moved out of the queue, so the
    /// hold is released for the next puller.
    pub async fn next_invocation(&self) -> anyhow::Result<Arc<RequestContext>> {
        loop {
            let queued = self.queue_rx.recv().await.map_err(|_| {
                ErrorMetadata::shutdown(
                    "FunctionShuttingDown",
                    format!("{} is shutting down", self.function_name),
                )
            })?;
            if queued.ctx.expired() || queued.reply.is_closed() {
                metrics::log_expired_in_queue();
                continue;
            }
            let ctx = queued.ctx.clone();
            self.in_flight.lock().insert(
                ctx.request_id.clone(),
                InFlightInvocation {
                    ctx: queued.ctx,
                    reply: queued.reply,
                },
            );
            return Ok(ctx);
        }
    }

    /// Container posted the final payload for a request id. First post
    /// wins; an unknown (or already-completed, or timed-out) id is an
    /// error and touches no state.
    pub fn post_response(
        &self,
        request_id: &RequestId,
        payload: Bytes,
        log_tail: Option<String>,
    ) -> anyhow::Result<()> {
        let entry = self.take_in_flight(request_id)?;
        metrics::log_completed();
        let _ = entry.reply.send(Ok(InvokeReply::Payload {
            bytes: payload,
            log_tail,
        }));
        Ok(())
    }

    /// Container posted an error envelope for a request id.
    pub fn post_error(
        &self,
        request_id: &RequestId,
        error: FunctionError,
        log_tail: Option<String>,
    ) -> anyhow::Result<()> {
        let entry = self.take_in_flight(request_id)?;
        metrics::log_function_error();
        let _ = entry
            .reply
            .send(Ok(InvokeReply::FunctionError { error, log_tail }));
        Ok(())
    }

    /// Fatal marker reported by an instance before any invocation.
    pub fn record_init_error(&self, error: FunctionError) {
        metrics::log_init_error();
        tracing::error!(
            "init error from an instance of {}: {}",
            self.function_name,
            error.error_message
        );
        *self.init_error.lock() = Some(error);
    }

    pub fn init_error(&self) -> Option<FunctionError> {
        self.init_error.lock().clone()
    }

    /// Block on the invocation's completion signal or its deadline,
    /// whichever fires first. Timeout firing is authoritative: the
    /// in-flight entry is removed atomically with respect to posting
    /// containers, so a late response is rejected rather than delivered.
    pub async fn await_reply(&self, handle: ReplyHandle) -> InvokeOutcome {
        let ReplyHandle {
            request_id,
            deadline,
            rx,
        } = handle;
        tokio::select! {
            result = rx => match result {
                Ok(Ok(reply)) => InvokeOutcome::Completed(reply),
                Ok(Err(em)) => InvokeOutcome::Failed(em),
                Err(_) => InvokeOutcome::Failed(ErrorMetadata::internal(
                    "ReplySlotDropped",
                    "The invocation's reply slot was dropped without completing",
                )),
            },
            _ = tokio::time::sleep_until(deadline) => {
                self.in_flight.lock().remove(&request_id);
                metrics::log_timeout();
                tracing::warn!(
                    "invocation {request_id} of {} timed out (timeout)",
                    self.function_name
                );
                InvokeOutcome::TimedOut
            },
        }
    }

    /// Fail everything and refuse new work: queued contexts and in-flight
    /// entries all complete with `error`. Used for function removal and
    /// process shutdown.
    pub fn shutdown(&self, error: ErrorMetadata) {
        self.queue_tx.close();
        while let Ok(queued) = self.queue_rx.try_recv() {
            let _ = queued.reply.send(Err(error.clone()));
        }
        let mut in_flight = self.in_flight.lock();
        for (_, entry) in in_flight.drain() {
            let _ = entry.reply.send(Err(error.clone()));
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue_rx.len()
    }

    fn take_in_flight(&self, request_id: &RequestId) -> anyhow::Result<InFlightInvocation> {
        self.in_flight.lock().remove(request_id).ok_or_else(|| {
            ErrorMetadata::internal(
                "InvalidRequestId",
                format!("No in-flight invocation with id {request_id}"),
            )
            .into()
        })
    }
}
