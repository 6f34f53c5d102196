use std::sync::{Arc, Weak};

use super::Channel;
use crate::error::PlexusError;
use crate::isolate::{Isolate, Value};

pub type ProcessId = u64;

pub const HOST_PROCESS_ID: ProcessId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Idle,
    Queued,
    Running,
    BlockedSend,
    BlockedRecv,
    BlockedAsyncRecv,
    BlockedBarrier,
}

impl ProcessStatus {
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ProcessStatus::BlockedSend
                | ProcessStatus::BlockedRecv
                | ProcessStatus::BlockedAsyncRecv
                | ProcessStatus::BlockedBarrier
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Worker,
    /// The embedding thread's own process. Never queued on a worker.
    Host,
}

/// Answer to a runtime request, handed to the process when it resumes.
#[derive(Debug)]
pub enum Reply {
    Done,
    Values(Vec<Value>),
    Count(i64),
    Failed(PlexusError),
}

// === Process ===

pub struct Process {
    pub(crate) id: ProcessId,
    pub(crate) status: ProcessStatus,
    pub(crate) isolate: Isolate,
    pub(crate) reply: Option<Reply>,
    /// Values on the isolate stack for the first run.
    pub(crate) pending_args: usize,
    /// Channel the process is parked on. Only meaningful while blocked.
    pub(crate) channel: Option<Weak<Channel>>,
    pub(crate) role: Role,
    pub(crate) started: bool,
}

impl Process {
    pub(crate) fn new(id: ProcessId, isolate: Isolate, role: Role, pending_args: usize) -> Box<Self> {
        Box::new(Self {
            id,
            status: ProcessStatus::Idle,
            isolate,
            reply: None,
            pending_args,
            channel: None,
            role,
            started: false,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn blocked_on(&self) -> Option<Arc<Channel>> {
        self.channel.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn block_on(&mut self, status: ProcessStatus, channel: &Arc<Channel>) {
        self.status = status;
        self.channel = Some(Arc::downgrade(channel));
    }

    pub(crate) fn answer(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    pub(crate) fn answer_with(&mut self, result: Result<(), PlexusError>) {
        self.reply = Some(match result {
            Ok(()) => Reply::Done,
            Err(e) => Reply::Failed(e),
        });
    }

    /// Push the pending reply onto the isolate stack and return how many values it took.
    pub(crate) fn deliver_reply(&mut self) -> usize {
        self.isolate.outbox.clear();
        match self.reply.take() {
            None | Some(Reply::Done) => {
                self.isolate.push(Value::Bool(true));
                1
            }
            Some(Reply::Values(values)) => {
                let n = values.len();
                for value in values {
                    self.isolate.push(value);
                }
                n
            }
            Some(Reply::Count(n)) => {
                self.isolate.push(Value::Int(n));
                1
            }
            Some(Reply::Failed(e)) => {
                self.isolate.push(Value::Nil);
                self.isolate.push(Value::from(e.to_string()));
                2
            }
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("role", &self.role)
            .finish()
    }
}
