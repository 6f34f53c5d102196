use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::Process;
use crate::isolate::Isolate;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Rendezvous: a send completes only when a receiver takes the message.
    Sync,
    /// Buffered in a mailbox isolate; senders never block.
    Async,
}

/// Single-use rendezvous of `expected` participants on one channel.
pub struct Barrier {
    pub(crate) expected: usize,
    pub(crate) participants: VecDeque<Box<Process>>,
    /// The host process, when it is one of the arrivals.
    pub(crate) coordinator: Option<Box<Process>>,
}

impl Barrier {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            expected,
            participants: VecDeque::new(),
            coordinator: None,
        }
    }

    pub(crate) fn arrivals(&self) -> usize {
        self.participants.len() + usize::from(self.coordinator.is_some())
    }

    /// Everyone parked on the barrier, coordinator last.
    pub(crate) fn drain(self) -> impl Iterator<Item = Box<Process>> {
        self.participants.into_iter().chain(self.coordinator)
    }
}

/// Everything guarded by a channel's own lock.
pub struct ChannelState {
    pub(crate) send_waiters: VecDeque<Box<Process>>,
    pub(crate) recv_waiters: VecDeque<Box<Process>>,
    pub(crate) mailbox: Option<Isolate>,
    pub(crate) barrier: Option<Barrier>,
}

pub struct Channel {
    name: String,
    kind: ChannelKind,
    pub(crate) state: Mutex<ChannelState>,
    /// Signalled, under the registry lock, whenever `state` is released.
    pub(crate) usable: Condvar,
}

impl Channel {
    pub(crate) fn new(name: &str, kind: ChannelKind, mailbox: Option<Isolate>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state: Mutex::new(ChannelState {
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
                mailbox,
                barrier: None,
            }),
            usable: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}
