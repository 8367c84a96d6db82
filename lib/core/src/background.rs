// Dedicated worker thread for CPU-bound jobs (index rebuilds).
// Jobs run one at a time in FIFO order; callers get a JobHandle back.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of work for the background worker.
pub trait BackgroundJob: Send + 'static {
    fn execute(self: Box<Self>);

    fn name(&self) -> &str;
}

/// Closure job whose return value is sent back through a [`JobHandle`].
struct FnJob<F> {
    name: String,
    task: F,
}

impl<F> BackgroundJob for FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn execute(self: Box<Self>) {
        (self.task)()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Future-like handle to the result of a submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Block until the job finishes. `None` if it panicked or was dropped
    /// by a shutdown.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Non-blocking poll. `Err(())` once the result can never arrive.
    pub fn try_wait(&self) -> std::result::Result<Option<T>, ()> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }
}

struct Shared {
    jobs: Mutex<VecDeque<Box<dyn BackgroundJob>>>,
    condvar: Condvar,
    running: AtomicBool,
    processed: AtomicU64,
}

/// Single background thread with a FIFO job queue.
pub struct BackgroundWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn new(name: &str) -> crate::Result<Self> {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
            processed: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("bg-{}", name))
            .spawn(move || run(worker_shared))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn submit(&self, job: Box<dyn BackgroundJob>) {
        if !self.shared.running.load(Ordering::Acquire) {
            debug!("Worker stopped, dropping job {}", job.name());
            return;
        }
        self.shared.jobs.lock().push_back(job);
        self.shared.condvar.notify_one();
    }

    /// Run `task` on the worker and hand back its result.
    pub fn spawn<T, F>(&self, name: &str, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        self.submit(Box::new(FnJob {
            name: name.to_string(),
            task: move || {
                // receiver may be gone already
                let _ = tx.send(task());
            },
        }));
        JobHandle { rx }
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn jobs_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Finish queued jobs, then stop the thread.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            // dropped from inside one of its own jobs; the loop exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Background worker thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("pending", &self.pending_jobs())
            .field("processed", &self.jobs_processed())
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            while jobs.is_empty() && shared.running.load(Ordering::Acquire) {
                shared.condvar.wait(&mut jobs);
            }
            match jobs.pop_front() {
                Some(job) => job,
                // stopped and drained
                None => break,
            }
        };

        let name = job.name().to_string();
        debug!("Running background job {}", name);
        if catch_unwind(AssertUnwindSafe(|| job.execute())).is_err() {
            error!("Background job {} panicked", name);
        }
        shared.processed.fetch_add(1, Ordering::Relaxed);
    }
}
