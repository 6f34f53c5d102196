use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::{Process, ProcessStatus, Role, Shared};
use crate::error::PlexusError;

/// What the worker does with a process after servicing one of its requests.
#[derive(Debug)]
pub enum SchedulerAction {
    /// The request completed; keep running the process.
    Continue(Box<Process>),
    /// The process is parked on a channel or barrier, which now owns it.
    Block,
}

pub(crate) enum Task {
    Run(Box<Process>),
    Retire,
}

struct WorkerPool {
    target: usize,
    next_index: usize,
    handles: Vec<JoinHandle<()>>,
}

// === Scheduler ===

pub struct Scheduler {
    ready: Mutex<VecDeque<Task>>,
    work_available: Condvar,
    live: Mutex<usize>,
    idle: Condvar,
    /// Where the host process lands when a peer completes its blocked operation.
    host: Mutex<Option<Box<Process>>>,
    host_ready: Condvar,
    workers: Mutex<WorkerPool>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            live: Mutex::new(0),
            idle: Condvar::new(),
            host: Mutex::new(None),
            host_ready: Condvar::new(),
            workers: Mutex::new(WorkerPool {
                target: 0,
                next_index: 0,
                handles: Vec::new(),
            }),
        }
    }

    /// Make a process runnable. The host is handed back to its own thread instead of a worker.
    pub(crate) fn submit(&self, mut process: Box<Process>) {
        if process.status.is_blocked() {
            let channel = process.blocked_on();
            log::trace!(
                "waking process {} from '{}'",
                process.id,
                channel.as_ref().map_or("<destroyed>", |c| c.name())
            );
        }
        process.status = ProcessStatus::Queued;
        process.channel = None;
        if process.role == Role::Host {
            *self.host.lock() = Some(process);
            self.host_ready.notify_all();
            return;
        }
        self.ready.lock().push_back(Task::Run(process));
        self.work_available.notify_one();
    }

    /// Block the host thread until its process is deposited back.
    pub(crate) fn wait_host(&self) -> Box<Process> {
        let mut slot = self.host.lock();
        loop {
            if let Some(process) = slot.take() {
                return process;
            }
            self.host_ready.wait(&mut slot);
        }
    }

    pub(crate) fn next_task(&self) -> Task {
        let mut ready = self.ready.lock();
        loop {
            if let Some(task) = ready.pop_front() {
                return task;
            }
            self.work_available.wait(&mut ready);
        }
    }

    pub(crate) fn process_started(&self) {
        *self.live.lock() += 1;
    }

    pub(crate) fn process_finished(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.idle.notify_all();
        }
    }

    pub fn live_processes(&self) -> usize {
        *self.live.lock()
    }

    /// Block until every spawned process has finished.
    pub fn wait_until_idle(&self) {
        let mut live = self.live.lock();
        while *live > 0 {
            self.idle.wait(&mut live);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().target
    }

    pub(crate) fn set_worker_count(&self, shared: &Arc<Shared>, n: i64) -> Result<(), PlexusError> {
        if n <= 0 {
            return Err(PlexusError::Configuration(
                "number of workers must be positive".to_string(),
            ));
        }
        let n = n as usize;

        let mut pool = self.workers.lock();
        pool.handles.retain(|handle| !handle.is_finished());

        while pool.target < n {
            let index = pool.next_index;
            let worker_shared = Arc::clone(shared);
            let handle = thread::Builder::new()
                .name(format!("plexus-worker-{}", index))
                .spawn(move || worker_loop(worker_shared, index))
                .map_err(PlexusError::WorkerSpawn)?;
            pool.next_index += 1;
            pool.target += 1;
            pool.handles.push(handle);
        }

        if pool.target > n {
            let retiring = pool.target - n;
            pool.target = n;
            self.retire(retiring);
        }
        log::debug!("worker count set to {}", n);
        Ok(())
    }

    fn retire(&self, count: usize) {
        let mut ready = self.ready.lock();
        for _ in 0..count {
            ready.push_back(Task::Retire);
        }
        self.work_available.notify_all();
    }

    /// Retire every worker and wait for the threads to exit.
    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut pool = self.workers.lock();
            let running = pool.target;
            pool.target = 0;
            self.retire(running);
            std::mem::take(&mut pool.handles)
        };
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    log::debug!("worker {} started", index);
    while let Task::Run(process) = shared.scheduler.next_task() {
        shared.run(process);
    }
    log::debug!("worker {} retired", index);
}
