mod channel;
mod host;
mod ops;
mod process;
mod recycle;
mod registry;
mod scheduler;

pub use channel::*;
pub use host::*;
pub use process::*;
pub use recycle::*;
pub use registry::*;
pub use scheduler::*;

use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::config::RuntimeConfig;
use crate::isolate::ModuleLoader;
use crate::transfer::HookRegistry;

/// State every worker thread and the host share.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: ChannelRegistry,
    pub(crate) scheduler: Scheduler,
    pub(crate) recycle: RecyclePool,
    pub(crate) hooks: HookRegistry,
    loaders: Vec<ModuleLoader>,
    next_pid: AtomicU64,
    /// Messages sitting in asynchronous mailboxes across all channels.
    pending_messages: AtomicUsize,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig, loaders: Vec<ModuleLoader>) -> Self {
        Self {
            recycle: RecyclePool::new(config.recycle_limit),
            config,
            registry: ChannelRegistry::new(),
            scheduler: Scheduler::new(),
            hooks: HookRegistry::new(),
            loaders,
            next_pid: AtomicU64::new(HOST_PROCESS_ID + 1),
            pending_messages: AtomicUsize::new(0),
        }
    }
}
