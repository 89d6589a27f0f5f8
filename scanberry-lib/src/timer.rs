//! Timer primitives backing the power state machine.
//!
//! [`Waiter`] runs one delayed future at a time; asking for a second delay
//! while one is pending is a programming error and is refused.
//! [`Countdown`] re-arms a fixed callback, replacing whatever was pending.
//! Both spawn onto the runtime that was current when they were created.

use crate::error::ScanError;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Default)]
struct Slot {
    generation: u64,
    /// Armed and still sleeping
    pending: Option<JoinHandle<()>>,
    /// Fired and running its callback
    running: Option<JoinHandle<()>>,
    closed: bool,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Waiter {
    name: &'static str,
    runtime: Handle,
    slot: Arc<Mutex<Slot>>,
}

impl Waiter {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        Self::with_runtime(name, Handle::current())
    }

    pub fn with_runtime(name: &'static str, runtime: Handle) -> Self {
        Self {
            name,
            runtime,
            slot: Arc::default(),
        }
    }

    /// Run `task` after `after` has elapsed.
    pub fn delay<F>(&self, after: Duration, task: F) -> Result<(), ScanError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.closed {
            debug!(waiter = self.name, "Delay requested after shutdown, ignoring");
            return Ok(());
        }
        if slot.pending.is_some() {
            error!(waiter = self.name, "Can only handle one parallel delay");
            return Err(ScanError::DelayPending);
        }
        slot.generation += 1;
        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        let name = self.name;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut slot = lock(&shared);
                // A stop() racing with the wake-up wins
                if slot.generation != generation || slot.pending.is_none() {
                    return;
                }
                slot.running = slot.pending.take();
            }
            debug!(waiter = name, "Delay elapsed");
            task.await;
        });
        slot.pending = Some(handle);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    /// Cancel the pending delay, if any. A callback that already fired keeps running.
    pub fn stop(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        if let Some(handle) = slot.pending.take() {
            debug!(waiter = self.name, "Delay cancelled");
            handle.abort();
        }
    }

    /// Cancel the pending delay, wait for a running callback, refuse further delays.
    pub async fn shutdown(&self) {
        let (pending, running) = {
            let mut slot = lock(&self.slot);
            slot.closed = true;
            slot.generation += 1;
            (slot.pending.take(), slot.running.take())
        };
        if let Some(handle) = pending {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = running {
            let _ = handle.await;
        }
    }
}

/// Restartable timer invoking a fixed callback on expiry.
pub struct Countdown {
    waiter: Waiter,
    on_expire: Arc<dyn Fn() + Send + Sync>,
}

impl Countdown {
    pub fn new(name: &'static str, on_expire: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_runtime(name, Handle::current(), on_expire)
    }

    pub fn with_runtime(
        name: &'static str,
        runtime: Handle,
        on_expire: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            waiter: Waiter::with_runtime(name, runtime),
            on_expire: Arc::new(on_expire),
        }
    }

    /// (Re)start counting down from `after`.
    pub fn restart(&self, after: Duration) {
        self.waiter.stop();
        let on_expire = Arc::clone(&self.on_expire);
        // Cannot be pending after stop()
        let _ = self.waiter.delay(after, async move { on_expire() });
    }

    pub fn stop(&self) {
        self.waiter.stop();
    }

    pub fn is_running(&self) -> bool {
        self.waiter.is_pending()
    }

    pub async fn shutdown(&self) {
        self.waiter.shutdown().await;
    }
}
