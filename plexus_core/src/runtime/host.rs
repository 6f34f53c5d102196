use std::sync::Arc;

use super::{ChannelKind, Process, ProcessId, ProcessStatus, Reply, Role, SchedulerAction, Shared, HOST_PROCESS_ID};
use crate::config::RuntimeConfig;
use crate::error::PlexusError;
use crate::isolate::{standard_loaders, Exit, Isolate, ModuleLoader, Proto, Request, Value};
use crate::transfer::{HandleHooks, HookContext};

/// Code a new process starts from.
#[derive(Debug)]
pub enum Code {
    Proto(Proto),
    /// A prototype in its serialized byte form.
    Bytes(Vec<u8>),
    /// A function value living in the host isolate. Its upvalues are copied too.
    Function(Value),
}

impl From<Proto> for Code {
    fn from(proto: Proto) -> Self {
        Code::Proto(proto)
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    loaders: Vec<ModuleLoader>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            loaders: standard_loaders(),
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn recycle_limit(mut self, limit: usize) -> Self {
        self.config.recycle_limit = limit;
        self
    }

    pub fn nesting_limit(mut self, limit: usize) -> Self {
        self.config.nesting_limit = limit;
        self
    }

    /// Install an extra module in every isolate the runtime creates.
    pub fn module(mut self, loader: ModuleLoader) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn build(self) -> Result<Runtime, PlexusError> {
        self.config.validate()?;
        let workers = self.config.workers;
        let shared = Arc::new(Shared::new(self.config, self.loaders));

        // Never collected mid-run; `host_request` collects between requests instead.
        let mut isolate = Isolate::new().with_gc_threshold(usize::MAX);
        for loader in &shared.loaders {
            loader(&mut isolate).map_err(PlexusError::Load)?;
        }

        if let Err(e) = shared.scheduler.set_worker_count(&shared, workers as i64) {
            shared.scheduler.shutdown();
            return Err(e);
        }
        log::debug!("runtime started with {} workers", workers);

        Ok(Runtime {
            shared,
            host: Some(Process::new(HOST_PROCESS_ID, isolate, Role::Host, 0)),
        })
    }
}

/// The embedding thread's handle on a running set of processes.
///
/// The host takes part in channel operations like any process, except that
/// blocking parks the calling thread rather than a worker.
///
/// The host isolate is garbage collected after every send, receive and
/// barrier. Values the embedder holds only in Rust variables do not survive
/// that; keep them reachable from the host isolate's globals.
pub struct Runtime {
    shared: Arc<Shared>,
    host: Option<Box<Process>>,
}

impl Runtime {
    pub fn new() -> Result<Self, PlexusError> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The host's own isolate, where values passed to and from the runtime live.
    pub fn isolate(&mut self) -> &mut Isolate {
        let shared = &self.shared;
        &mut self.host.get_or_insert_with(|| shared.scheduler.wait_host()).isolate
    }

    fn host_process(&mut self) -> Box<Process> {
        match self.host.take() {
            Some(process) => process,
            None => self.shared.scheduler.wait_host(),
        }
    }

    /// Service a request for the host, parking this thread if it blocks.
    fn service_host(&mut self, request: Request) -> &mut Box<Process> {
        let process = self.host_process();
        let mut process = match self.shared.service(process, request) {
            SchedulerAction::Continue(process) => process,
            SchedulerAction::Block => self.shared.scheduler.wait_host(),
        };
        process.status = ProcessStatus::Running;
        self.host.insert(process)
    }

    fn host_request(&mut self, request: Request, values: Vec<Value>) -> Result<Vec<Value>, PlexusError> {
        self.isolate().outbox = values;
        let process = self.service_host(request);
        process.isolate.outbox.clear();
        let result = match process.reply.take() {
            None | Some(Reply::Done) => Ok(Vec::new()),
            Some(Reply::Values(values)) => Ok(values),
            Some(Reply::Count(n)) => Ok(vec![Value::Int(n)]),
            Some(Reply::Failed(e)) => Err(e),
        };
        let freed = process.isolate.collect_garbage_with(result.as_deref().unwrap_or(&[]));
        log::trace!("host collection freed {} objects", freed);
        result
    }

    // === Processes ===

    pub fn spawn(&mut self, code: impl Into<Code>, args: Vec<Value>) -> Result<ProcessId, PlexusError> {
        let shared = Arc::clone(&self.shared);
        let isolate = self.isolate();
        let function = match code.into() {
            Code::Proto(proto) => isolate.load_proto(proto).map_err(PlexusError::Load)?,
            Code::Bytes(bytes) => isolate.load_bytes(&bytes).map_err(PlexusError::Load)?,
            Code::Function(function) => function,
        };
        let mut staged = Vec::with_capacity(args.len() + 1);
        staged.push(function);
        staged.extend(args);
        isolate.outbox = staged;
        shared.spawn_from(isolate)
    }

    /// Run a function in the host isolate, servicing the runtime calls it makes.
    pub fn call(&mut self, function: Value, args: Vec<Value>) -> Result<Vec<Value>, PlexusError> {
        let mut exit = self.isolate().call_function(function, args);
        loop {
            match exit {
                Exit::Finished(values) => return Ok(values),
                Exit::Failed(message) => return Err(PlexusError::Process(message)),
                Exit::Request(request) => {
                    let process = self.service_host(request);
                    let n = process.deliver_reply();
                    exit = process.isolate.resume(n);
                }
            }
        }
    }

    /// Block until every spawned process has finished.
    pub fn wait(&self) {
        self.shared.scheduler.wait_until_idle();
    }

    pub fn live_processes(&self) -> usize {
        self.shared.scheduler.live_processes()
    }

    // === Channels ===

    pub fn create_channel(&self, name: &str, kind: ChannelKind) -> Result<(), PlexusError> {
        self.shared.create_channel(name, kind)
    }

    pub fn destroy_channel(&self, name: &str) -> Result<(), PlexusError> {
        self.shared.destroy_channel(name)
    }

    pub fn channel_exists(&self, name: &str) -> bool {
        self.shared.registry.contains(name)
    }

    /// Send host-isolate values. Blocks on a synchronous channel until a receiver takes them.
    pub fn send(&mut self, channel: &str, values: Vec<Value>) -> Result<(), PlexusError> {
        let request = Request::Send {
            channel: channel.to_string(),
        };
        self.host_request(request, values).map(|_| ())
    }

    pub fn receive(&mut self, channel: &str, nonblocking: bool) -> Result<Vec<Value>, PlexusError> {
        let request = Request::Receive {
            channel: channel.to_string(),
            nonblocking,
        };
        self.host_request(request, Vec::new())
    }

    pub fn barrier(&mut self, channel: &str, expected: i64) -> Result<(), PlexusError> {
        let request = Request::Barrier {
            channel: channel.to_string(),
            expected,
        };
        self.host_request(request, Vec::new()).map(|_| ())
    }

    /// Messages queued in asynchronous mailboxes and not yet received.
    pub fn pending_messages(&self) -> usize {
        self.shared.pending_messages()
    }

    // === Tuning ===

    pub fn set_worker_count(&self, n: i64) -> Result<(), PlexusError> {
        self.shared.scheduler.set_worker_count(&self.shared, n)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.scheduler.worker_count()
    }

    pub fn set_recycle_limit(&self, n: i64) -> Result<(), PlexusError> {
        self.shared.recycle.set_limit(n)
    }

    pub fn recycle_limit(&self) -> usize {
        self.shared.recycle.limit()
    }

    pub fn pooled_isolates(&self) -> usize {
        self.shared.recycle.len()
    }

    // === Handles ===

    pub fn register_handle_hooks<S, R>(&self, type_name: &str, send: S, recv: R) -> Result<(), PlexusError>
    where
        S: Fn(&mut HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
        R: Fn(&mut HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.shared.hooks.register(type_name, HandleHooks::new(send, recv))
    }

    pub fn register_handle_hook_table(&self, table: Vec<(String, HandleHooks)>) -> Result<(), PlexusError> {
        self.shared.hooks.register_table(table)
    }

    /// Retire and join every worker. Processes still parked are dropped with the runtime.
    pub fn shutdown(&self) {
        self.shared.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::isolate::{Capture, Op, ProtoBuilder, PLEXUS_MODULE};
    use std::thread;
    use std::time::{Duration, Instant};

    fn runtime(workers: usize) -> Runtime {
        RuntimeBuilder::new().workers(workers).build().unwrap()
    }

    /// Wait until `count` processes are parked on `channel`.
    fn wait_for_parked(rt: &Runtime, channel: &str, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let parked = rt
                .shared
                .registry
                .with_channel(channel, (), |_, state, ()| {
                    state.send_waiters.len()
                        + state.recv_waiters.len()
                        + state.barrier.as_ref().map_or(0, |b| b.arrivals())
                })
                .unwrap_or(0);
            if parked >= count {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting on '{}'", channel);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// `plexus.<name>(<string arg>, ...)` with the extra arguments pushed by `args`.
    fn call_plexus(b: &mut ProtoBuilder, name: &str, channel: &str, args: impl FnOnce(&mut ProtoBuilder) -> u8, results: u8) {
        b.module_fn(PLEXUS_MODULE, name).string(channel);
        let n = args(b);
        b.call(n + 1, results);
    }

    /// Receive once from `from`, then forward the first two received values to `to`.
    fn forwarder(from: &str, to: &str) -> Proto {
        let mut b = ProtoBuilder::new("forward", 0);
        b.module_fn(PLEXUS_MODULE, "send").string(to);
        b.module_fn(PLEXUS_MODULE, "receive").string(from).call(1, 2);
        b.call(3, 0);
        b.ret(0);
        b.build().unwrap()
    }

    /// `plexus.send(channel, value)`
    fn sender(channel: &str, value: i64) -> Proto {
        let mut b = ProtoBuilder::new("sender", 0);
        call_plexus(&mut b, "send", channel, |b| { b.int(value); 1 }, 0);
        b.ret(0);
        b.build().unwrap()
    }

    /// `plexus.send("r", plexus.<op>(channel, arg))`, keeping two results.
    fn reporter(op: &str, channel: &str, arg: i64) -> Proto {
        let mut b = ProtoBuilder::new("reporter", 0);
        b.module_fn(PLEXUS_MODULE, "send").string("r");
        b.module_fn(PLEXUS_MODULE, op).string(channel).int(arg).call(2, 2);
        b.call(3, 0);
        b.ret(0);
        b.build().unwrap()
    }

    #[test]
    fn test_sync_send_and_receive() {
        let mut rt = runtime(2);
        rt.create_channel("c", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();

        let mut b = ProtoBuilder::new("sender", 0);
        let ok = b.local();
        call_plexus(&mut b, "send", "c", |b| { b.int(1).int(2); 2 }, 1);
        b.set_local(ok);
        call_plexus(&mut b, "send", "r", |b| { b.get_local(ok); 1 }, 0);
        b.ret(0);
        rt.spawn(b.build().unwrap(), vec![]).unwrap();

        assert_eq!(rt.receive("c", false).unwrap(), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::Bool(true)]);
        rt.wait();
        assert_eq!(rt.live_processes(), 0);
    }

    #[test]
    fn test_sync_nonblocking_receive_without_sender() {
        let mut rt = runtime(1);
        rt.create_channel("c", ChannelKind::Sync).unwrap();
        let err = rt.receive("c", true).unwrap_err();
        assert_eq!(err.to_string(), "no senders waiting on channel 'c'");
        assert!(matches!(rt.receive("missing", true), Err(PlexusError::ChannelNotFound { .. })));
    }

    #[test]
    fn test_async_mailbox_round_trip() {
        let mut rt = runtime(1);
        rt.create_channel("m", ChannelKind::Async).unwrap();
        rt.send("m", vec![Value::string("x")]).unwrap();
        assert_eq!(rt.pending_messages(), 1);
        assert_eq!(rt.receive("m", false).unwrap(), vec![Value::string("x")]);
        assert_eq!(rt.pending_messages(), 0);
        assert!(matches!(rt.receive("m", true), Err(PlexusError::NoWaitingPeer { .. })));
    }

    #[test]
    fn test_async_delivery_keeps_send_order() {
        let mut rt = runtime(2);
        rt.create_channel("q", ChannelKind::Async).unwrap();

        let mut b = ProtoBuilder::new("producer", 1);
        let i = b.local();
        let top = b.label();
        let done = b.label();
        b.int(1).set_local(i);
        b.place(top).get_local(i).get_local(0).op(Op::Le).jump_if_false(done);
        call_plexus(&mut b, "send", "q", |b| { b.get_local(i); 1 }, 0);
        b.get_local(i).int(1).op(Op::Add).set_local(i).jump(top);
        b.place(done).ret(0);
        rt.spawn(b.build().unwrap(), vec![Value::Int(20)]).unwrap();

        for expected in 1..=20 {
            assert_eq!(rt.receive("q", false).unwrap(), vec![Value::Int(expected)]);
        }
        rt.wait();
    }

    #[test]
    fn test_waiting_receiver_matched_directly_on_async_channel() {
        let mut rt = runtime(1);
        rt.create_channel("m", ChannelKind::Async).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();
        rt.spawn(forwarder("m", "r"), vec![]).unwrap();
        wait_for_parked(&rt, "m", 1);

        rt.send("m", vec![Value::Int(5)]).unwrap();
        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::Int(5), Value::Nil]);
        rt.wait();
    }

    #[test]
    fn test_barrier_releases_only_on_last_arrival() {
        let mut rt = runtime(3);
        rt.create_channel("b", ChannelKind::Sync).unwrap();
        rt.create_channel("done", ChannelKind::Async).unwrap();

        let mut b = ProtoBuilder::new("participant", 0);
        call_plexus(&mut b, "barrier", "b", |b| { b.int(3); 1 }, 0);
        call_plexus(&mut b, "send", "done", |b| { b.boolean(true); 1 }, 0);
        b.ret(0);
        let participant = b.build().unwrap();
        rt.spawn(participant.clone(), vec![]).unwrap();
        rt.spawn(participant, vec![]).unwrap();

        wait_for_parked(&rt, "b", 2);
        assert!(matches!(rt.receive("done", true), Err(PlexusError::NoWaitingPeer { .. })));

        rt.barrier("b", 3).unwrap();
        assert_eq!(rt.receive("done", false).unwrap(), vec![Value::Bool(true)]);
        assert_eq!(rt.receive("done", false).unwrap(), vec![Value::Bool(true)]);
        rt.wait();
    }

    #[test]
    fn test_host_waits_at_barrier_as_coordinator() {
        let mut rt = runtime(2);
        rt.create_channel("b", ChannelKind::Sync).unwrap();

        let mut b = ProtoBuilder::new("late", 0);
        call_plexus(&mut b, "barrier", "b", |b| { b.int(2); 1 }, 0);
        b.ret(0);
        rt.spawn(b.build().unwrap(), vec![]).unwrap();

        rt.barrier("b", 2).unwrap();
        rt.wait();
        assert!(rt.barrier("b", 0).is_err());
    }

    #[test]
    fn test_destroy_refuses_non_empty_mailbox() {
        let mut rt = runtime(1);
        rt.create_channel("m", ChannelKind::Async).unwrap();
        rt.send("m", vec![Value::Int(1)]).unwrap();

        let err = rt.destroy_channel("m").unwrap_err();
        assert_eq!(err.to_string(), "asynchronous channel 'm' still stores messages");
        assert!(rt.channel_exists("m"));

        rt.receive("m", false).unwrap();
        rt.destroy_channel("m").unwrap();
        assert!(!rt.channel_exists("m"));
        assert!(matches!(rt.destroy_channel("m"), Err(PlexusError::ChannelNotFound { .. })));
    }

    #[test]
    fn test_destroy_wakes_parked_receiver() {
        let mut rt = runtime(1);
        rt.create_channel("w", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();
        rt.spawn(forwarder("w", "r"), vec![]).unwrap();
        wait_for_parked(&rt, "w", 1);

        rt.destroy_channel("w").unwrap();
        let reply = rt.receive("r", false).unwrap();
        assert_eq!(reply[0], Value::Nil);
        assert_eq!(reply[1], Value::string("channel 'w' destroyed while waiting for sender"));
        rt.wait();
    }

    #[test]
    fn test_nesting_limit_reported_to_both_sides() {
        let mut rt = runtime(1);
        rt.create_channel("deep", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();
        rt.spawn(forwarder("deep", "r"), vec![]).unwrap();
        wait_for_parked(&rt, "deep", 1);

        let isolate = rt.isolate();
        let mut value = Value::Int(0);
        for _ in 0..251 {
            let table = isolate.new_table();
            isolate.set_field(table, "next", value).unwrap();
            value = Value::Table(table);
        }
        let err = rt.send("deep", vec![value]).unwrap_err();
        assert!(matches!(
            err,
            PlexusError::Transfer(TransferError::NestingLimitExceeded { limit: 250 })
        ));

        let reply = rt.receive("r", false).unwrap();
        assert_eq!(reply[0], Value::Nil);
        assert_eq!(reply[1], Value::string("number of nesting levels not supported (limit 250)"));
        rt.wait();
    }

    #[test]
    fn test_worker_count_changes() {
        let rt = runtime(2);
        assert_eq!(rt.worker_count(), 2);
        let err = rt.set_worker_count(0).unwrap_err();
        assert_eq!(err.to_string(), "number of workers must be positive");
        rt.set_worker_count(4).unwrap();
        assert_eq!(rt.worker_count(), 4);
        rt.set_worker_count(1).unwrap();
        assert_eq!(rt.worker_count(), 1);
    }

    #[test]
    fn test_failing_process_does_not_stop_worker() {
        let mut rt = runtime(1);
        rt.create_channel("r", ChannelKind::Async).unwrap();

        let mut bad = ProtoBuilder::new("bad", 0);
        bad.get_global("error").string("boom").call(1, 0).ret(0);
        rt.spawn(bad.build().unwrap(), vec![]).unwrap();

        let mut good = ProtoBuilder::new("good", 0);
        call_plexus(&mut good, "send", "r", |b| { b.string("alive"); 1 }, 0);
        good.ret(0);
        rt.spawn(good.build().unwrap(), vec![]).unwrap();

        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::string("alive")]);
        rt.wait();
    }

    #[test]
    fn test_spawn_closure_carries_upvalues() {
        let mut rt = runtime(1);
        rt.create_channel("r", ChannelKind::Async).unwrap();

        let mut b = ProtoBuilder::new("answer", 0);
        let base = b.capture(Capture::Upvalue(0));
        call_plexus(&mut b, "send", "r", |b| { b.get_upvalue(base).int(1).op(Op::Add); 1 }, 0);
        b.ret(0);

        let isolate = rt.isolate();
        let function = isolate.load_proto(b.build().unwrap()).unwrap();
        let Value::Function(f) = function else {
            panic!("expected a closure");
        };
        isolate.set_upvalue(f, 0, Value::Int(41)).unwrap();

        rt.spawn(Code::Function(function), vec![]).unwrap();
        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::Int(42)]);
        rt.wait();
    }

    #[test]
    fn test_spawn_rejects_non_function() {
        let mut rt = runtime(1);
        let err = rt.spawn(Code::Function(Value::Int(3)), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "cannot use 'number' to create a new process");
        assert_eq!(rt.live_processes(), 0);
    }

    #[test]
    fn test_handle_moves_to_receiver() {
        let mut rt = runtime(1);
        rt.register_handle_hooks(
            "blob",
            |ctx| {
                let bytes = ctx.source_bytes()?.to_vec();
                ctx.push_handle(bytes);
                Ok(())
            },
            |ctx| {
                let bytes = ctx.source_bytes()?.to_vec();
                ctx.push_handle(bytes);
                Ok(())
            },
        )
        .unwrap();
        rt.create_channel("h", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();

        // local h = plexus.receive("h"); plexus.send("r", handle.read(h))
        let mut b = ProtoBuilder::new("reader", 0);
        let h = b.local();
        call_plexus(&mut b, "receive", "h", |_| 0, 1);
        b.set_local(h);
        call_plexus(&mut b, "send", "r", |b| { b.module_fn("handle", "read").get_local(h).call(1, 1); 1 }, 0);
        b.ret(0);
        rt.spawn(b.build().unwrap(), vec![]).unwrap();
        wait_for_parked(&rt, "h", 1);

        let handle = rt.isolate().new_handle("blob", b"abc".to_vec());
        // Anchored in a global so it outlives the collection after the send.
        rt.isolate().set_global("blob", handle.clone()).unwrap();
        rt.send("h", vec![handle.clone()]).unwrap();
        let Value::Handle(h) = handle else {
            panic!("expected a handle");
        };
        assert_eq!(rt.isolate().handle_bytes(h), Err(TransferError::HandleAlreadyTransferred));
        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::string("abc")]);
        rt.wait();
    }

    #[test]
    fn test_process_spawns_child() {
        let mut rt = runtime(2);
        rt.create_channel("r", ChannelKind::Async).unwrap();

        let mut child = ProtoBuilder::new("child", 1);
        call_plexus(&mut child, "send", "r", |b| { b.get_local(0).int(2).op(Op::Mul); 1 }, 0);
        child.ret(0);

        let mut parent = ProtoBuilder::new("parent", 0);
        parent.module_fn(PLEXUS_MODULE, "spawn").closure(child.build().unwrap()).int(21).call(2, 0);
        parent.ret(0);
        rt.spawn(parent.build().unwrap(), vec![]).unwrap();

        assert_eq!(rt.receive("r", false).unwrap(), vec![Value::Int(42)]);
        rt.wait();
    }

    #[test]
    fn test_finished_isolates_are_recycled() {
        let mut rt = runtime(1);
        rt.set_recycle_limit(2).unwrap();
        let mut b = ProtoBuilder::new("noop", 0);
        b.ret(0);
        let noop = b.build().unwrap();

        rt.spawn(noop.clone(), vec![]).unwrap();
        rt.wait();
        assert_eq!(rt.pooled_isolates(), 1);
        rt.spawn(noop, vec![]).unwrap();
        rt.wait();
        assert_eq!(rt.pooled_isolates(), 1);

        assert!(rt.set_recycle_limit(-1).is_err());
        rt.set_recycle_limit(0).unwrap();
        assert_eq!(rt.pooled_isolates(), 0);
    }

    #[test]
    fn test_host_code_uses_runtime_module() {
        let mut rt = runtime(1);
        let mut b = ProtoBuilder::new("main", 0);
        call_plexus(&mut b, "newchannel", "m", |b| { b.boolean(true); 1 }, 0);
        call_plexus(&mut b, "send", "m", |b| { b.string("hi"); 1 }, 0);
        call_plexus(&mut b, "receive", "m", |_| 0, crate::isolate::MULTI);
        b.ret(crate::isolate::MULTI);
        let main = rt.isolate().load_proto(b.build().unwrap()).unwrap();
        assert_eq!(rt.call(main, vec![]).unwrap(), vec![Value::string("hi")]);

        let mut b = ProtoBuilder::new("count", 0);
        b.module_fn(PLEXUS_MODULE, "getnumworkers").call(0, 1).ret(1);
        let count = rt.isolate().load_proto(b.build().unwrap()).unwrap();
        assert_eq!(rt.call(count, vec![]).unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_parked_senders_matched_in_arrival_order() {
        let mut rt = runtime(2);
        rt.create_channel("c", ChannelKind::Sync).unwrap();
        rt.spawn(sender("c", 1), vec![]).unwrap();
        wait_for_parked(&rt, "c", 1);
        rt.spawn(sender("c", 2), vec![]).unwrap();
        wait_for_parked(&rt, "c", 2);

        assert_eq!(rt.receive("c", false).unwrap(), vec![Value::Int(1)]);
        assert_eq!(rt.receive("c", false).unwrap(), vec![Value::Int(2)]);
        rt.wait();
    }

    #[test]
    fn test_parked_receivers_matched_in_arrival_order() {
        let mut rt = runtime(2);
        rt.create_channel("c", ChannelKind::Sync).unwrap();
        rt.create_channel("first", ChannelKind::Async).unwrap();
        rt.create_channel("second", ChannelKind::Async).unwrap();
        rt.spawn(forwarder("c", "first"), vec![]).unwrap();
        wait_for_parked(&rt, "c", 1);
        rt.spawn(forwarder("c", "second"), vec![]).unwrap();
        wait_for_parked(&rt, "c", 2);

        rt.send("c", vec![Value::Int(1)]).unwrap();
        rt.send("c", vec![Value::Int(2)]).unwrap();
        assert_eq!(rt.receive("first", false).unwrap(), vec![Value::Int(1), Value::Nil]);
        assert_eq!(rt.receive("second", false).unwrap(), vec![Value::Int(2), Value::Nil]);
        rt.wait();
    }

    #[test]
    fn test_destroy_wakes_parked_sender() {
        let mut rt = runtime(1);
        rt.create_channel("w", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();
        rt.spawn(reporter("send", "w", 1), vec![]).unwrap();
        wait_for_parked(&rt, "w", 1);

        rt.destroy_channel("w").unwrap();
        assert_eq!(
            rt.receive("r", false).unwrap(),
            vec![Value::Nil, Value::string("channel 'w' destroyed while waiting for receiver")]
        );
        rt.wait();
    }

    #[test]
    fn test_destroy_wakes_barrier_participants() {
        let mut rt = runtime(2);
        rt.create_channel("b", ChannelKind::Sync).unwrap();
        rt.create_channel("r", ChannelKind::Async).unwrap();
        let participant = reporter("barrier", "b", 3);
        rt.spawn(participant.clone(), vec![]).unwrap();
        rt.spawn(participant, vec![]).unwrap();
        wait_for_parked(&rt, "b", 2);

        rt.destroy_channel("b").unwrap();
        for _ in 0..2 {
            assert_eq!(
                rt.receive("r", false).unwrap(),
                vec![Value::Nil, Value::string("channel 'b' destroyed while waiting for barrier")]
            );
        }
        rt.wait();
        assert_eq!(rt.live_processes(), 0);
    }

    #[test]
    fn test_host_heap_stays_bounded_across_receives() {
        let mut rt = runtime(1);
        rt.create_channel("m", ChannelKind::Async).unwrap();
        let mut baseline = None;
        for i in 0..100 {
            let isolate = rt.isolate();
            let list = isolate.new_list([Value::Int(i), Value::string("payload")]);
            let outer = isolate.new_table();
            isolate.set_field(outer, "list", Value::Table(list)).unwrap();
            rt.send("m", vec![Value::Table(outer)]).unwrap();

            let received = rt.receive("m", false).unwrap();
            let Value::Table(copy) = received[0] else {
                panic!("expected a table");
            };
            // The reply itself survives the collection.
            let Value::Table(inner) = rt.isolate().field(copy, "list").unwrap() else {
                panic!("expected the nested list");
            };
            assert_eq!(rt.isolate().get(inner, &Value::Int(1)).unwrap(), Value::Int(i));

            let objects = rt.isolate().heap().len();
            match baseline {
                None => baseline = Some(objects),
                Some(limit) => assert!(objects <= limit, "host heap grew to {} objects", objects),
            }
        }
    }
}
