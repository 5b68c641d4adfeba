//! The worker pool that services aggregation-server connections.

use crate::Result;

/// A pool of threads that connection-handling jobs can be spawned onto,
/// keeping slow clients from monopolizing the accept loop.
pub trait ThreadPool {
    /// creates a pool with the given number of `threads`
    ///
    /// # Errors
    /// errors if the threads could not be created at the OS level
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Spawns a job into the pool.
    ///
    /// The job runs on one of the pool's threads as soon as one is free;
    /// spawning never blocks the caller.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod shared_queue;

pub use self::shared_queue::SharedQueueThreadPool;
