//! Pool of plugin handles for callers that need concurrency.
//!
//! One call per handle at a time; concurrency comes from holding several
//! handles, never from pipelining on one connection. Handles are created
//! lazily up to `max_size` and handed out by availability.
//!
//! A handle whose connection failed is poisoned: it is released instead of
//! going back to the idle list, and the next checkout launches a fresh one.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::bridge::TransportError;
use crate::capability::{RequestEnvelope, ResponseEnvelope, StepError, StepPlugin};
use crate::client::RpcClient;
use crate::context::CallContext;
use crate::launcher::{LaunchError, PluginHandle, PluginLauncher};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("plugin pool is shut down")]
    Closed,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Call(StepError),
}

impl From<PoolError> for StepError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Call(e) => e,
            other => StepError::Unavailable(other.to_string()),
        }
    }
}

struct PoolInner {
    slots: Arc<Semaphore>,
    idle: StdMutex<Vec<PluginHandle>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<PluginHandle>> {
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct PluginPool {
    launcher: PluginLauncher,
    max_size: usize,
    inner: Arc<PoolInner>,
}

impl PluginPool {
    pub fn new(launcher: PluginLauncher, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            launcher,
            max_size,
            inner: Arc::new(PoolInner {
                slots: Arc::new(Semaphore::new(max_size)),
                idle: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Handles that are running and not checked out.
    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    /// Slots not currently checked out.
    pub fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Wait for a free slot and return a live handle for it, launching a new
    /// process if no idle one is left.
    pub async fn checkout(&self, ctx: &CallContext) -> Result<PooledPlugin, PoolError> {
        if let Some(reason) = ctx.err() {
            return Err(PoolError::Call(reason.into()));
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.slots).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
            reason = ctx.done() => return Err(PoolError::Call(reason.into())),
        };
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let reused = loop {
            let Some(handle) = self.inner.lock_idle().pop() else {
                break None;
            };
            if handle.client().is_closed() {
                tracing::debug!(pid = handle.pid(), "Discarding dead idle plugin");
                release_in_background(handle);
                continue;
            }
            break Some(handle);
        };

        let handle = match reused {
            Some(handle) => handle,
            None => {
                let launched = tokio::select! {
                    launched = self.launcher.acquire() => launched?,
                    reason = ctx.done() => return Err(PoolError::Call(reason.into())),
                };
                tracing::debug!(pid = launched.pid(), "Pool launched plugin");
                launched
            }
        };

        Ok(PooledPlugin {
            handle: Some(handle),
            _permit: permit,
            pool: Arc::clone(&self.inner),
            poisoned: false,
        })
    }

    /// Stop handing out handles and release every idle one. Checked-out
    /// handles are released when they come back.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.slots.close();

        let idle: Vec<PluginHandle> = std::mem::take(&mut *self.inner.lock_idle());
        tracing::info!(count = idle.len(), "Shutting down plugin pool");
        for mut handle in idle {
            handle.release().await;
        }
    }
}

#[async_trait::async_trait]
impl StepPlugin for PluginPool {
    async fn run(
        &self,
        ctx: &CallContext,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, StepError> {
        let mut plugin = self.checkout(ctx).await?;
        let result = plugin.client().run(ctx, request).await;
        // An oversized request never reached the plugin; the handle is fine.
        if let Err(StepError::Transport(e)) = &result
            && !matches!(e, TransportError::Encode(_))
        {
            plugin.poison();
        }
        result
    }
}

/// A checked-out handle. Returns to the pool on drop unless poisoned.
pub struct PooledPlugin {
    handle: Option<PluginHandle>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
    poisoned: bool,
}

impl PooledPlugin {
    fn handle(&self) -> &PluginHandle {
        // Only taken in Drop.
        self.handle.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn client(&self) -> &RpcClient {
        self.handle().client()
    }

    pub fn pid(&self) -> u32 {
        self.handle().pid()
    }

    /// Do not reuse this handle.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for PooledPlugin {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let dead = handle.client().is_closed();
        if self.poisoned || dead || self.pool.closed.load(Ordering::Acquire) {
            tracing::debug!(
                pid = handle.pid(),
                poisoned = self.poisoned,
                dead,
                "Plugin not returned to pool"
            );
            release_in_background(handle);
            return;
        }
        self.pool.lock_idle().push(handle);
    }
}

fn release_in_background(mut handle: PluginHandle) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                handle.release().await;
            });
        }
        // No runtime: the handle's Drop kills the child.
        Err(_) => drop(handle),
    }
}
