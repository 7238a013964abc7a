//! Delayed and periodic tasks, driven from one dedicated timer thread.

use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::{runtime::Handle, select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Task = Arc<dyn Fn() + Send + Sync>;

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    cancel: CancellationToken,
}

impl ScheduledTask {
    /// Stop any future firings. A firing already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs tasks after a delay, optionally repeating
///
/// Timing happens on a current-thread runtime owned by a dedicated thread.
/// When firing, a task is handed to the worker pool if there is one, otherwise
/// it runs on the timer thread itself. Panics are caught and logged.
pub struct Scheduler {
    handle: Handle,
    pool: Option<Handle>,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn run_guarded(task: &Task) {
    if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
        error!("Scheduled task panicked");
    }
}

impl Scheduler {
    pub(crate) fn start(name: &str, pool: Option<Handle>) -> io::Result<Scheduler> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || {
                runtime.block_on(stopped.cancelled());
                debug!("Scheduler thread exiting");
            })?;
        Ok(Scheduler {
            handle,
            pool,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` after `delay`, then every `period` if one is given
    pub fn schedule<F>(&self, task: F, delay: Duration, period: Option<Duration>) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancel = self.stop.child_token();
        let token = cancel.clone();
        let pool = self.pool.clone();
        let task: Task = Arc::new(task);
        self.handle.spawn(async move {
            let mut wait = delay;
            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = sleep(wait) => (),
                }
                match &pool {
                    Some(pool) => {
                        let task = task.clone();
                        pool.spawn_blocking(move || run_guarded(&task));
                    }
                    None => run_guarded(&task),
                }
                match period {
                    Some(period) => wait = period,
                    None => break,
                }
            }
        });
        ScheduledTask { cancel }
    }

    /// Handle to the timer runtime, for work that should run on it directly
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cancel every task and stop the timer thread
    pub fn shutdown(&self) {
        self.stop.cancel();
        let Some(thread) = self.thread.lock().unwrap().take() else {
            return;
        };
        // A task running inline on the timer thread cannot wait for itself
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
