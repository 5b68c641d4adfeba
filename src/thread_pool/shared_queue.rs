use super::ThreadPool;
use crate::Result;
use crossbeam::channel::{self, Receiver, Sender};
use std::thread;
use tracing::{debug, error};

/// A fixed-size thread pool fed from a shared job queue.
///
/// The queue is a crossbeam MPMC [`channel`] used single-producer,
/// multi-consumer: the pool holds the sending half and every worker thread
/// holds a clone of the receiving half. Workers block on the channel and run
/// jobs as they arrive; when the pool is dropped the channel disconnects and
/// each worker exits after finishing its current job.
///
/// A worker that panics while running a job is replaced with a fresh thread,
/// so a single bad connection cannot shrink the pool.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    // the sending half of the job queue
    tx: Sender<Job>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for _ in 0..threads {
            let worker_rx = JobReceiver(rx.clone());
            thread::Builder::new().spawn(move || run_jobs(worker_rx))?;
        }
        debug!("started worker pool with {} threads", threads);
        Ok(SharedQueueThreadPool { tx })
    }

    /// Spawns a job into the pool.
    ///
    /// # Panics
    ///
    /// Panics if every worker thread has died and respawning failed.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .expect("there are no threads in the pool");
    }
}

// the receiving half of the job queue; its Drop impl respawns the worker
// thread when it is being torn down by a panicking job
#[derive(Clone)]
struct JobReceiver(Receiver<Job>);

impl Drop for JobReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("worker panicked, starting a replacement thread");
            let worker_rx = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || run_jobs(worker_rx)) {
                error!("failed to spawn a replacement worker: {}", e);
            }
        }
    }
}

// blocks on the job queue and runs jobs until the pool is dropped
fn run_jobs(rx: JobReceiver) {
    loop {
        match rx.0.recv() {
            Ok(job) => job(),
            Err(_) => {
                debug!("worker exiting, the pool was dropped");
                break;
            }
        }
    }
}
