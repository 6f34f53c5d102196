use parking_lot::Mutex;

use crate::error::PlexusError;
use crate::isolate::Isolate;

struct PoolState {
    limit: usize,
    idle: Vec<Isolate>,
}

/// Bounded cache of isolates left behind by finished processes.
pub struct RecyclePool {
    state: Mutex<PoolState>,
}

impl RecyclePool {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                limit,
                idle: Vec::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Change the limit, closing pooled isolates beyond it.
    pub fn set_limit(&self, limit: i64) -> Result<(), PlexusError> {
        if limit < 0 {
            return Err(PlexusError::Configuration(
                "recycle limit must be non-negative".to_string(),
            ));
        }
        let closed = {
            let mut state = self.state.lock();
            state.limit = limit as usize;
            let keep = state.idle.len().min(state.limit);
            state.idle.split_off(keep)
        };
        if !closed.is_empty() {
            log::debug!("closed {} pooled isolates", closed.len());
        }
        Ok(())
    }

    pub fn take(&self) -> Option<Isolate> {
        let mut state = self.state.lock();
        if state.limit == 0 {
            return None;
        }
        state.idle.pop()
    }

    /// Reset and keep `isolate` if there is room, else close it.
    pub fn put(&self, mut isolate: Isolate) {
        {
            let state = self.state.lock();
            if state.idle.len() >= state.limit {
                log::trace!("closing finished isolate");
                return;
            }
        }
        isolate.reset();
        let mut state = self.state.lock();
        if state.idle.len() < state.limit {
            state.idle.push(isolate);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
