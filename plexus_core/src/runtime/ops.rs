//! Servicing of runtime requests. Shared by worker threads and the host.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{
    Barrier, Channel, ChannelKind, Process, ProcessId, ProcessStatus, Reply, Role, SchedulerAction, Shared,
};
use crate::error::PlexusError;
use crate::isolate::{Exit, Isolate, Request, Value};
use crate::transfer::{transfer_message, Direction};

enum SendOutcome {
    /// A receiver was waiting; the copy happens after the channel is released.
    Matched { sender: Box<Process>, receiver: Box<Process> },
    Answered(Box<Process>),
    Parked,
}

enum ReceiveOutcome {
    Matched { receiver: Box<Process>, sender: Box<Process> },
    Answered(Box<Process>),
    Parked,
}

enum BarrierOutcome {
    Released { caller: Box<Process>, waiting: Vec<Box<Process>> },
    Parked,
}

impl Shared {
    // === Execution ===

    /// Run a process until it finishes or parks.
    pub(crate) fn run(self: &Arc<Self>, mut process: Box<Process>) {
        loop {
            process.status = ProcessStatus::Running;
            let exit = if process.started {
                let n = process.deliver_reply();
                process.isolate.resume(n)
            } else {
                process.started = true;
                let nargs = process.pending_args;
                process.isolate.start(nargs)
            };

            match exit {
                Exit::Finished(_) => break,
                Exit::Failed(message) => {
                    log::warn!("process {} failed: {}", process.id, message);
                    break;
                }
                Exit::Request(request) => match self.service(process, request) {
                    SchedulerAction::Continue(p) => process = p,
                    SchedulerAction::Block => return,
                },
            }
        }
        self.complete(process);
    }

    fn complete(&self, process: Box<Process>) {
        log::trace!("process {} finished", process.id);
        self.recycle.put(process.isolate);
        self.scheduler.process_finished();
    }

    pub(crate) fn service(self: &Arc<Self>, mut process: Box<Process>, request: Request) -> SchedulerAction {
        log::trace!("process {} requests {}", process.id, request.name());
        match request {
            Request::Send { channel } => return self.send(process, &channel),
            Request::Receive { channel, nonblocking } => return self.receive(process, &channel, nonblocking),
            Request::Barrier { channel, expected } => return self.barrier(process, &channel, expected),
            Request::Spawn => {
                let result = self.spawn_from(&mut process.isolate).map(|_| ());
                process.answer_with(result);
            }
            Request::CreateChannel { name, kind } => process.answer_with(self.create_channel(&name, kind)),
            Request::DestroyChannel { name } => process.answer_with(self.destroy_channel(&name)),
            Request::SetWorkers(n) => process.answer_with(self.scheduler.set_worker_count(self, n)),
            Request::GetWorkers => process.answer(Reply::Count(self.scheduler.worker_count() as i64)),
            Request::SetRecycleLimit(n) => process.answer_with(self.recycle.set_limit(n)),
        }
        SchedulerAction::Continue(process)
    }

    // === Processes ===

    fn fresh_isolate(&self) -> Result<Isolate, PlexusError> {
        if let Some(isolate) = self.recycle.take() {
            log::trace!("reusing pooled isolate");
            return Ok(isolate);
        }
        let mut isolate = Isolate::new().with_gc_threshold(self.config.gc_threshold);
        for loader in &self.loaders {
            loader(&mut isolate).map_err(PlexusError::Load)?;
        }
        Ok(isolate)
    }

    /// Create a process from the function and arguments staged in `parent`'s outbox.
    pub(crate) fn spawn_from(&self, parent: &mut Isolate) -> Result<ProcessId, PlexusError> {
        let staged = parent.outbox.clone();
        let code = staged.first().cloned().unwrap_or(Value::Nil);
        if !matches!(code, Value::Function(_) | Value::Native(_)) {
            parent.outbox.clear();
            return Err(PlexusError::InvalidCode {
                kind: code.type_name(),
            });
        }

        let mut isolate = self.fresh_isolate()?;
        let copied = transfer_message(
            parent,
            &staged,
            &mut isolate,
            Direction::ToNormal,
            &self.hooks,
            self.config.nesting_limit,
        );
        parent.outbox.clear();
        let copied = match copied {
            Ok(copied) => copied,
            Err(e) => {
                self.recycle.put(isolate);
                return Err(e.into());
            }
        };

        let nargs = copied.len() - 1;
        for value in copied {
            isolate.push(value);
        }
        let id = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.scheduler.process_started();
        self.scheduler.submit(Process::new(id, isolate, Role::Worker, nargs));
        log::trace!("spawned process {}", id);
        Ok(id)
    }

    // === Channels ===

    pub(crate) fn create_channel(&self, name: &str, kind: ChannelKind) -> Result<(), PlexusError> {
        let mailbox = match kind {
            ChannelKind::Sync => None,
            ChannelKind::Async => Some(Isolate::new_mailbox().with_gc_threshold(self.config.gc_threshold)),
        };
        self.registry.insert(Channel::new(name, kind, mailbox))?;
        log::debug!("created {:?} channel '{}'", kind, name);
        Ok(())
    }

    /// Remove a channel, failing every process still parked on it.
    pub(crate) fn destroy_channel(&self, name: &str) -> Result<(), PlexusError> {
        let woken = self
            .registry
            .with_channel(name, (), |_, state, ()| {
                if let Some(mailbox) = &state.mailbox {
                    if mailbox.queued_messages() > 0 {
                        return Err(PlexusError::MailboxNotEmpty { name: name.to_string() });
                    }
                }
                self.registry.remove(name);

                let destroyed = |peer| Reply::Failed(PlexusError::ChannelDestroyed {
                    name: name.to_string(),
                    peer,
                });
                let mut woken = Vec::new();
                for mut process in state.send_waiters.drain(..) {
                    process.answer(destroyed("receiver"));
                    woken.push(process);
                }
                for mut process in state.recv_waiters.drain(..) {
                    process.answer(destroyed("sender"));
                    woken.push(process);
                }
                if let Some(barrier) = state.barrier.take() {
                    for mut process in barrier.drain() {
                        process.answer(destroyed("barrier"));
                        woken.push(process);
                    }
                }
                Ok(woken)
            })
            .map_err(|((), e)| e)??;

        log::debug!("destroyed channel '{}', waking {} waiters", name, woken.len());
        for process in woken {
            self.scheduler.submit(process);
        }
        Ok(())
    }

    fn send(self: &Arc<Self>, process: Box<Process>, name: &str) -> SchedulerAction {
        let outcome = self.registry.with_channel(name, process, |channel, state, mut process| {
            if let Some(receiver) = state.recv_waiters.pop_front() {
                return SendOutcome::Matched {
                    sender: process,
                    receiver,
                };
            }
            match channel.kind() {
                ChannelKind::Sync => {
                    log::trace!("process {} parked sending on '{}'", process.id, name);
                    process.block_on(ProcessStatus::BlockedSend, channel);
                    state.send_waiters.push_back(process);
                    SendOutcome::Parked
                }
                ChannelKind::Async => {
                    let result = match state.mailbox.as_mut() {
                        Some(mailbox) => self.post(&mut process.isolate, mailbox),
                        None => Err(PlexusError::Process(format!("channel '{}' has no mailbox", name))),
                    };
                    process.answer_with(result);
                    SendOutcome::Answered(process)
                }
            }
        });

        match outcome {
            Ok(SendOutcome::Matched {
                mut sender,
                mut receiver,
            }) => {
                log::trace!("process {} matched receiver {} on '{}'", sender.id, receiver.id, name);
                self.hand_over(&mut sender, &mut receiver, Direction::ToNormal);
                self.scheduler.submit(receiver);
                SchedulerAction::Continue(sender)
            }
            Ok(SendOutcome::Answered(process)) => SchedulerAction::Continue(process),
            Ok(SendOutcome::Parked) => SchedulerAction::Block,
            Err((mut process, e)) => {
                process.answer(Reply::Failed(e));
                SchedulerAction::Continue(process)
            }
        }
    }

    /// Copy the sender's outbox into a mailbox as one queued message.
    fn post(&self, sender: &mut Isolate, mailbox: &mut Isolate) -> Result<(), PlexusError> {
        let values = std::mem::take(&mut sender.outbox);
        let copied = transfer_message(
            sender,
            &values,
            mailbox,
            Direction::ToMailbox,
            &self.hooks,
            self.config.nesting_limit,
        )?;
        mailbox.enqueue_message(copied);
        self.pending_messages.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Copy a matched pair's message and tell both sides how it went.
    fn hand_over(&self, sender: &mut Process, receiver: &mut Process, direction: Direction) {
        let values = std::mem::take(&mut sender.isolate.outbox);
        match transfer_message(
            &mut sender.isolate,
            &values,
            &mut receiver.isolate,
            direction,
            &self.hooks,
            self.config.nesting_limit,
        ) {
            Ok(copied) => {
                receiver.answer(Reply::Values(copied));
                sender.answer(Reply::Done);
            }
            Err(e) => {
                let e = PlexusError::from(e);
                receiver.answer(Reply::Failed(e.duplicate()));
                sender.answer(Reply::Failed(e));
            }
        }
    }

    fn receive(self: &Arc<Self>, process: Box<Process>, name: &str, nonblocking: bool) -> SchedulerAction {
        let outcome = self.registry.with_channel(name, process, |channel, state, mut process| {
            match channel.kind() {
                ChannelKind::Sync => {
                    if let Some(sender) = state.send_waiters.pop_front() {
                        return ReceiveOutcome::Matched {
                            receiver: process,
                            sender,
                        };
                    }
                }
                ChannelKind::Async => {
                    if let Some(mailbox) = state.mailbox.as_mut() {
                        if mailbox.queued_messages() > 0 {
                            let reply = self.collect(mailbox, &mut process.isolate);
                            process.answer(reply);
                            return ReceiveOutcome::Answered(process);
                        }
                    }
                }
            }

            if nonblocking {
                process.answer(Reply::Failed(PlexusError::NoWaitingPeer { name: name.to_string() }));
                return ReceiveOutcome::Answered(process);
            }
            let status = match channel.kind() {
                ChannelKind::Sync => ProcessStatus::BlockedRecv,
                ChannelKind::Async => ProcessStatus::BlockedAsyncRecv,
            };
            log::trace!("process {} parked receiving on '{}'", process.id, name);
            process.block_on(status, channel);
            state.recv_waiters.push_back(process);
            ReceiveOutcome::Parked
        });

        match outcome {
            Ok(ReceiveOutcome::Matched {
                mut receiver,
                mut sender,
            }) => {
                log::trace!("process {} matched sender {} on '{}'", receiver.id, sender.id, name);
                self.hand_over(&mut sender, &mut receiver, Direction::FromNormal);
                self.scheduler.submit(sender);
                SchedulerAction::Continue(receiver)
            }
            Ok(ReceiveOutcome::Answered(process)) => SchedulerAction::Continue(process),
            Ok(ReceiveOutcome::Parked) => SchedulerAction::Block,
            Err((mut process, e)) => {
                process.answer(Reply::Failed(e));
                SchedulerAction::Continue(process)
            }
        }
    }

    /// Copy the oldest mailbox message out. It leaves the queue only if the copy succeeds.
    fn collect(&self, mailbox: &mut Isolate, receiver: &mut Isolate) -> Reply {
        let message = match mailbox.front_message() {
            Some(message) => message.to_vec(),
            None => return Reply::Values(Vec::new()),
        };
        match transfer_message(
            mailbox,
            &message,
            receiver,
            Direction::FromMailbox,
            &self.hooks,
            self.config.nesting_limit,
        ) {
            Ok(values) => {
                mailbox.pop_message();
                self.pending_messages.fetch_sub(1, Ordering::AcqRel);
                Reply::Values(values)
            }
            Err(e) => Reply::Failed(e.into()),
        }
    }

    pub(crate) fn pending_messages(&self) -> usize {
        self.pending_messages.load(Ordering::Acquire)
    }

    // === Barrier ===

    fn barrier(self: &Arc<Self>, mut process: Box<Process>, name: &str, expected: i64) -> SchedulerAction {
        if expected < 1 {
            process.answer(Reply::Failed(PlexusError::Configuration(
                "barrier needs at least one participant".to_string(),
            )));
            return SchedulerAction::Continue(process);
        }

        let outcome = self.registry.with_channel(name, process, |channel, state, mut process| {
            let barrier = state
                .barrier
                .get_or_insert_with(|| Barrier::new(expected as usize));
            if barrier.arrivals() + 1 < barrier.expected {
                log::trace!(
                    "process {} waiting at barrier '{}' ({} of {})",
                    process.id,
                    name,
                    barrier.arrivals() + 1,
                    barrier.expected
                );
                process.block_on(ProcessStatus::BlockedBarrier, channel);
                if process.is_host() {
                    barrier.coordinator = Some(process);
                } else {
                    barrier.participants.push_back(process);
                }
                return BarrierOutcome::Parked;
            }

            let waiting = state
                .barrier
                .take()
                .map(|barrier| barrier.drain().collect())
                .unwrap_or_default();
            process.answer(Reply::Done);
            BarrierOutcome::Released { caller: process, waiting }
        });

        match outcome {
            Ok(BarrierOutcome::Released { caller, waiting }) => {
                log::trace!("barrier '{}' released {} waiters", name, waiting.len());
                for mut process in waiting {
                    process.answer(Reply::Done);
                    self.scheduler.submit(process);
                }
                SchedulerAction::Continue(caller)
            }
            Ok(BarrierOutcome::Parked) => SchedulerAction::Block,
            Err((mut process, e)) => {
                process.answer(Reply::Failed(e));
                SchedulerAction::Continue(process)
            }
        }
    }
}
