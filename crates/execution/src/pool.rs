use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Fixed-size pool running blocking work items on the tokio blocking pool.
///
/// At most `size` items run at once; the rest wait for a slot.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    name: Arc<str>,
    slots: Arc<Semaphore>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, handle: Handle) -> Self {
        Self {
            name: Arc::from(name),
            slots: Arc::new(Semaphore::new(size.max(1))),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Queue `job`; returns immediately.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let name = Arc::clone(&self.name);
        self.handle.spawn(async move {
            let permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(pool = %name, error = %e, "worker pool closed, dropping job");
                    return;
                }
            };
            debug!(pool = %name, "worker pool job started");
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job();
            })
            .await;
            if let Err(e) = joined {
                error!(pool = %name, error = %e, "worker pool job aborted");
            }
        });
    }

    /// Stop accepting new work; queued items are dropped.
    pub fn close(&self) {
        self.slots.close();
    }
}
