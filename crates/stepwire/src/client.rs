//! Host side: the RPC client adapter.
//!
//! `RpcClient` implements `StepPlugin` by forwarding each call over the
//! plugin connection. A background reader task routes replies to waiting
//! callers by sequence number; when the connection drops, every waiting
//! caller fails with `ConnectionClosed`.
//!
//! Calls on one client are serialized: one outstanding call per handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::TransportError;
use crate::bridge::codec::{JsonCodec, is_encode_error};
use crate::bridge::protocol::{HostMessage, PluginMessage, RUN_METHOD};
use crate::bridge::transport::{BoxedReader, BoxedWriter, Connection};
use crate::capability::{RequestEnvelope, ResponseEnvelope, StepError, StepPlugin};
use crate::context::CallContext;

type HostWriter = FramedWrite<BoxedWriter, JsonCodec<HostMessage>>;

#[derive(Default)]
struct PendingCalls {
    waiters: HashMap<u64, oneshot::Sender<PluginMessage>>,
    closed: bool,
}

struct Shared {
    writer: Mutex<HostWriter>,
    pending: StdMutex<PendingCalls>,
    next_seq: AtomicU64,
    call_gate: Mutex<()>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        // A panic while holding this lock cannot leave the map inconsistent.
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self) -> Result<(u64, oneshot::Receiver<PluginMessage>), TransportError> {
        let mut pending = self.lock_pending();
        if pending.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(seq, tx);
        Ok((seq, rx))
    }

    fn close(&self) {
        let mut pending = self.lock_pending();
        pending.closed = true;
        // Dropping the senders wakes every waiter with an error.
        pending.waiters.clear();
    }
}

/// Removes the waiter on every exit path: reply, error, cancellation, or
/// the caller dropping the future.
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().waiters.remove(&self.seq);
    }
}

/// RPC client adapter bound to one plugin connection. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// Take over a connection. Must be called within a tokio runtime.
    pub fn new(conn: Connection) -> Self {
        let (reader, writer) = conn.into_split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(FramedWrite::new(writer, JsonCodec::new())),
            pending: StdMutex::new(PendingCalls::default()),
            next_seq: AtomicU64::new(1),
            call_gate: Mutex::new(()),
            reader_task: StdMutex::new(None),
        });

        let task = tokio::spawn(read_replies(
            FramedRead::new(reader, JsonCodec::<PluginMessage>::new()),
            Arc::clone(&shared),
        ));
        if let Ok(mut slot) = shared.reader_task.lock() {
            *slot = Some(task);
        }

        Self { shared }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_pending().closed
    }

    /// Issue one call and wait for its reply, the connection dropping, or
    /// `ctx` finishing, whichever comes first.
    pub async fn call(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Box<RawValue>,
    ) -> Result<Box<RawValue>, StepError> {
        let reply = self
            .roundtrip(ctx, |seq| HostMessage::Call {
                seq,
                method: method.to_string(),
                payload,
            })
            .await?;

        match reply {
            PluginMessage::Reply {
                error: Some(error), ..
            } => Err(StepError::from(error)),
            PluginMessage::Reply {
                payload: Some(payload),
                ..
            } => Ok(payload),
            PluginMessage::Reply { seq, .. } => Err(TransportError::Protocol(format!(
                "reply {seq} has neither payload nor error"
            ))
            .into()),
            other => Err(TransportError::Protocol(format!("unexpected reply {other:?}")).into()),
        }
    }

    /// Liveness check. Returns the round-trip time.
    pub async fn ping(&self, ctx: &CallContext) -> Result<Duration, StepError> {
        let started = Instant::now();
        match self.roundtrip(ctx, |seq| HostMessage::Ping { seq }).await? {
            PluginMessage::Pong { .. } => Ok(started.elapsed()),
            other => Err(TransportError::Protocol(format!("unexpected reply {other:?}")).into()),
        }
    }

    /// Ask the plugin to stop serving. Does not wait for it to exit.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut writer = self.shared.writer.lock().await;
        writer.send(HostMessage::Shutdown).await?;
        Ok(())
    }

    /// Stop the reader task and fail any waiting callers.
    pub fn close(&self) {
        self.shared.close();
        if let Ok(mut slot) = self.shared.reader_task.lock()
            && let Some(task) = slot.take()
        {
            task.abort();
        }
    }

    async fn roundtrip<F>(&self, ctx: &CallContext, build: F) -> Result<PluginMessage, StepError>
    where
        F: FnOnce(u64) -> HostMessage,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let _gate = tokio::select! {
            gate = self.shared.call_gate.lock() => gate,
            reason = ctx.done() => return Err(reason.into()),
        };

        let (seq, rx) = self.shared.register()?;
        let _guard = PendingGuard {
            shared: &self.shared,
            seq,
        };

        let message = build(seq);
        tokio::select! {
            sent = async {
                let mut writer = self.shared.writer.lock().await;
                writer.send(message).await
            } => {
                if let Err(e) = sent {
                    tracing::warn!(seq, error = %e, "Failed to send call");
                    if is_encode_error(&e) {
                        return Err(TransportError::Encode(e.to_string()).into());
                    }
                    return Err(TransportError::Io(e).into());
                }
            }
            reason = ctx.done() => return Err(reason.into()),
        }
        tracing::trace!(seq, "Call sent");

        tokio::select! {
            reply = rx => reply.map_err(|_| StepError::Transport(TransportError::ConnectionClosed)),
            reason = ctx.done() => {
                tracing::debug!(seq, ?reason, "Abandoning call");
                Err(reason.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl StepPlugin for RpcClient {
    async fn run(
        &self,
        ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError> {
        let payload = self.call(ctx, RUN_METHOD, request.into_raw()).await?;
        Ok(ResponseEnvelope::from_raw(payload))
    }
}

async fn read_replies(
    mut reader: FramedRead<BoxedReader, JsonCodec<PluginMessage>>,
    shared: Arc<Shared>,
) {
    loop {
        match reader.next().await {
            Some(Ok(PluginMessage::ShuttingDown)) => {
                tracing::debug!("Plugin is shutting down");
            }
            Some(Ok(message)) => {
                let Some(seq) = message.seq() else { continue };
                let waiter = shared.lock_pending().waiters.remove(&seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        tracing::debug!(seq, "Discarding reply for abandoned call");
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Plugin connection error");
                break;
            }
            None => {
                tracing::debug!("Plugin connection closed");
                break;
            }
        }
    }
    shared.close();
}
