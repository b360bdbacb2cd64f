//! Execution model: deferred units, the interrupt top half and buffer recovery.
//!
//! The driver never spawns threads itself. Deferred per-channel units and recovery tasks are
//! posted to an [`Executor`], which keeps the library independent of the async runtime. A
//! [`TokioExecutor`] is provided behind the `tokio` feature; tests use a manual executor
//! that runs jobs on demand.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use asic_knet::runtime::{Executor, TokioExecutor};
//!
//! let exec: Arc<dyn Executor> = Arc::new(TokioExecutor::new(2).unwrap());
//! exec.spawn(Box::new(|| println!("deferred unit")));
//! ```

mod intr;
mod recovery;
mod work;

use std::time::Duration;

pub use intr::{InterruptDispatcher, IrqStatus};
pub(crate) use intr::Deferred;
pub(crate) use recovery::RecoveryTask;
pub use work::WorkItem;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where deferred units and recovery tasks run.
pub trait Executor: Send + Sync + 'static {
    /// Run a short, non-blocking job.
    fn spawn(&self, job: Job);

    /// Run a job that may sleep.
    fn spawn_blocking(&self, job: Job);

    /// Back-off used by blocking jobs between retries.
    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

#[cfg(feature = "tokio")]
pub use tokio_exec::TokioExecutor;

#[cfg(feature = "tokio")]
mod tokio_exec {
    use std::io;

    use tokio::runtime::{Builder, Handle, Runtime};
    use tracing::debug;

    use super::{Executor, Job};

    /// Executor backed by a multi-thread tokio runtime.
    pub struct TokioExecutor {
        handle: Handle,
        // Held so the worker threads outlive the driver.
        rt: Option<Runtime>,
    }

    impl TokioExecutor {
        /// Build a dedicated runtime with `workers` threads.
        pub fn new(workers: usize) -> io::Result<Self> {
            let rt = Builder::new_multi_thread()
                .worker_threads(workers.max(1))
                .thread_name("knet-worker")
                .build()?;
            debug!(workers, "tokio executor started");
            Ok(Self {
                handle: rt.handle().clone(),
                rt: Some(rt),
            })
        }

        /// Run on an existing runtime.
        pub fn from_handle(handle: Handle) -> Self {
            Self { handle, rt: None }
        }
    }

    impl std::fmt::Debug for TokioExecutor {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TokioExecutor")
                .field("owned", &self.rt.is_some())
                .finish()
        }
    }

    impl Executor for TokioExecutor {
        fn spawn(&self, job: Job) {
            self.handle.spawn(async move { job() });
        }

        fn spawn_blocking(&self, job: Job) {
            self.handle.spawn_blocking(job);
        }
    }

    impl Drop for TokioExecutor {
        fn drop(&mut self) {
            if let Some(rt) = self.rt.take() {
                rt.shutdown_background();
            }
        }
    }
}
