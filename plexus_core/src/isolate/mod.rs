mod builder;
mod heap;
mod proto;
mod request;
mod stdlib;
mod value;
mod vm;

pub use builder::*;
pub use heap::*;
pub use proto::*;
pub use request::*;
pub use stdlib::*;
pub use value::*;
pub use vm::*;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::DEFAULT_GC_THRESHOLD;
use crate::error::TransferError;

pub const GLOBALS_MODULE: &str = "_G";

// Path index walks stop this deep; module trees are never nested further in practice.
const MAX_PATH_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolateKind {
    Normal,
    /// Backs an asynchronous channel; holds queued messages and never runs code.
    Mailbox,
}

/// Installs a module into a fresh isolate.
pub type ModuleLoader = fn(&mut Isolate) -> Result<(), String>;

/// Where each native function sits under the modules, and which tables were
/// walked to find out. A write into any of those tables makes it stale.
struct NativeIndex {
    paths: HashMap<Native, Vec<String>>,
    tables: HashSet<ObjRef>,
}

/// An execution context with its own heap, stack and globals.
///
/// Nothing inside an isolate is reachable from another one; the transfer
/// engine is the only bridge.
pub struct Isolate {
    kind: IsolateKind,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    globals: ObjRef,
    modules: BTreeMap<String, ObjRef>,
    handle_types: HashSet<String>,
    pub(crate) outbox: Vec<Value>,
    messages: VecDeque<Vec<Value>>,
    pub(crate) pending_results: Option<u8>,
    native_paths: Option<NativeIndex>,
    gc_threshold: usize,
}

impl Isolate {
    pub fn new() -> Self {
        let mut isolate = Self::bare(IsolateKind::Normal);
        let globals = isolate.globals;
        isolate.modules.insert(GLOBALS_MODULE.to_string(), globals);
        isolate
    }

    pub fn new_mailbox() -> Self {
        Self::bare(IsolateKind::Mailbox)
    }

    fn bare(kind: IsolateKind) -> Self {
        let mut heap = Heap::new();
        let globals = heap.alloc_table();
        Self {
            kind,
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            modules: BTreeMap::new(),
            handle_types: HashSet::new(),
            outbox: Vec::new(),
            messages: VecDeque::new(),
            pending_results: None,
            native_paths: None,
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }

    pub fn with_gc_threshold(mut self, threshold: usize) -> Self {
        self.gc_threshold = threshold.max(1);
        self
    }

    pub fn kind(&self) -> IsolateKind {
        self.kind
    }

    pub fn is_mailbox(&self) -> bool {
        self.kind == IsolateKind::Mailbox
    }

    pub fn globals(&self) -> ObjRef {
        self.globals
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // === Tables ===

    pub fn new_table(&mut self) -> ObjRef {
        self.heap.alloc_table()
    }

    pub fn get(&self, table: ObjRef, key: &Value) -> Result<Value, String> {
        let key = Key::try_from(key)?;
        Ok(self.heap.table(table)?.get(&key))
    }

    pub fn set(&mut self, table: ObjRef, key: Value, value: Value) -> Result<(), String> {
        let key = Key::try_from(&key)?;
        self.heap.table_mut(table)?.set(key, value);
        if self.native_paths.as_ref().is_some_and(|index| index.tables.contains(&table)) {
            self.native_paths = None;
        }
        Ok(())
    }

    pub fn field(&self, table: ObjRef, name: &str) -> Result<Value, String> {
        Ok(self.heap.table(table)?.get(&Key::from(name)))
    }

    pub fn set_field(&mut self, table: ObjRef, name: &str, value: Value) -> Result<(), String> {
        self.set(table, Value::string(name), value)
    }

    pub fn table_len(&self, table: ObjRef) -> Result<usize, String> {
        Ok(self.heap.table(table)?.len())
    }

    pub fn table_entries(&self, table: ObjRef) -> Result<Vec<(Value, Value)>, String> {
        Ok(self
            .heap
            .table(table)?
            .entries()
            .map(|(k, v)| (k.to_value(), v.clone()))
            .collect())
    }

    /// Build a sequence table `{values[0], values[1], ...}`.
    pub fn new_list(&mut self, values: impl IntoIterator<Item = Value>) -> ObjRef {
        let table = self.heap.alloc_table();
        if let Ok(t) = self.heap.table_mut(table) {
            for (i, value) in values.into_iter().enumerate() {
                t.set(Key::Int(i as i64 + 1), value);
            }
        }
        table
    }

    pub fn get_global(&self, name: &str) -> Result<Value, String> {
        self.field(self.globals, name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), String> {
        self.set_field(self.globals, name, value)
    }

    // === Handles ===

    pub fn register_handle_type(&mut self, type_name: &str) {
        self.handle_types.insert(type_name.to_string());
    }

    pub fn has_handle_type(&self, type_name: &str) -> bool {
        self.handle_types.contains(type_name)
    }

    /// Allocate a typed handle around `block`, registering the type locally.
    pub fn new_handle(&mut self, type_name: &str, block: Vec<u8>) -> Value {
        self.register_handle_type(type_name);
        Value::Handle(self.heap.alloc(Object::Handle(HandleObject {
            type_name: Some(type_name.to_string()),
            block,
            denied: false,
        })))
    }

    pub fn new_untyped_handle(&mut self, block: Vec<u8>) -> Value {
        Value::Handle(self.heap.alloc(Object::Handle(HandleObject {
            type_name: None,
            block,
            denied: false,
        })))
    }

    /// Backing bytes of a handle. Fails once the handle has been transferred away.
    pub fn handle_bytes(&self, handle: ObjRef) -> Result<&[u8], TransferError> {
        let object = self.heap.handle(handle).map_err(TransferError::InvalidReference)?;
        if object.denied {
            return Err(TransferError::HandleAlreadyTransferred);
        }
        Ok(&object.block)
    }

    pub fn handle_type(&self, handle: ObjRef) -> Result<Option<&str>, String> {
        Ok(self.heap.handle(handle)?.type_name.as_deref())
    }

    pub fn is_denied(&self, handle: ObjRef) -> Result<bool, String> {
        Ok(self.heap.handle(handle)?.denied)
    }

    pub(crate) fn deny_handle(&mut self, handle: ObjRef) -> Result<(), String> {
        self.heap.handle_mut(handle)?.denied = true;
        Ok(())
    }

    pub fn new_thread(&mut self, body: Value) -> Value {
        Value::Thread(self.heap.alloc(Object::Thread(body)))
    }

    // === Code ===

    /// Instantiate a prototype as a closure. Upvalues start out nil except
    /// those bound to the global table.
    pub fn load_proto(&mut self, proto: Proto) -> Result<Value, String> {
        proto.verify()?;
        self.instantiate(Arc::new(proto))
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<Value, String> {
        let proto = Proto::undump(bytes)?;
        self.instantiate(Arc::new(proto))
    }

    pub(crate) fn instantiate(&mut self, proto: Arc<Proto>) -> Result<Value, String> {
        let mut upvalues = Vec::with_capacity(proto.captures.len());
        for capture in &proto.captures {
            let initial = match capture {
                Capture::Globals => Value::Table(self.globals),
                _ => Value::Nil,
            };
            upvalues.push(self.heap.alloc_cell(initial));
        }
        Ok(Value::Function(self.heap.alloc(Object::Closure(Closure { proto, upvalues }))))
    }

    pub fn dump_closure(&self, function: ObjRef) -> Result<Vec<u8>, String> {
        self.heap.closure(function)?.proto.dump()
    }

    pub fn upvalue_count(&self, function: ObjRef) -> Result<usize, String> {
        Ok(self.heap.closure(function)?.upvalues.len())
    }

    pub(crate) fn upvalue_cell(&self, function: ObjRef, index: usize) -> Result<ObjRef, String> {
        self.heap
            .closure(function)?
            .upvalues
            .get(index)
            .copied()
            .ok_or_else(|| format!("upvalue index {} out of range", index))
    }

    pub fn upvalue(&self, function: ObjRef, index: usize) -> Result<Value, String> {
        let cell = self.upvalue_cell(function, index)?;
        Ok(self.heap.cell(cell)?.clone())
    }

    pub fn set_upvalue(&mut self, function: ObjRef, index: usize, value: Value) -> Result<(), String> {
        let cell = self.upvalue_cell(function, index)?;
        *self.heap.cell_mut(cell)? = value;
        Ok(())
    }

    // === Stack ===

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    /// Value `depth` slots below the top; 0 is the top.
    pub fn peek(&self, depth: usize) -> Option<&Value> {
        self.stack.len().checked_sub(depth + 1).and_then(|i| self.stack.get(i))
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate_stack(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    // === Modules ===

    pub fn register_module(&mut self, name: &str, table: ObjRef) -> Result<(), String> {
        self.heap.table(table)?;
        self.modules.insert(name.to_string(), table);
        self.native_paths = None;
        if name != GLOBALS_MODULE {
            let globals = self.globals;
            self.heap.table_mut(globals)?.set(Key::from(name), Value::Table(table));
        }
        Ok(())
    }

    /// Create a module table holding the given natives and register it.
    pub fn register_natives(&mut self, name: &str, natives: &[(&'static str, NativeFn)]) -> Result<ObjRef, String> {
        let table = self.heap.alloc_table();
        {
            let t = self.heap.table_mut(table)?;
            for &(fname, func) in natives {
                t.set(Key::from(fname), Value::Native(Native::new(fname, func)));
            }
        }
        self.register_module(name, table)?;
        Ok(table)
    }

    pub fn module(&self, name: &str) -> Option<ObjRef> {
        self.modules.get(name).copied()
    }

    pub fn module_name_of(&self, table: ObjRef) -> Option<&str> {
        self.modules
            .iter()
            .find(|(_, t)| **t == table)
            .map(|(name, _)| name.as_str())
    }

    /// Path of module keys leading to `native`, from an index built on first use.
    pub fn native_path(&mut self, native: Native) -> Option<Vec<String>> {
        if self.native_paths.is_none() {
            self.native_paths = Some(self.build_native_paths());
        }
        self.native_paths.as_ref().and_then(|index| index.paths.get(&native).cloned())
    }

    fn build_native_paths(&self) -> NativeIndex {
        let mut paths = HashMap::new();
        let mut visited = HashSet::new();
        // Named modules first so their paths win over the globals route.
        let order = self
            .modules
            .iter()
            .filter(|(name, _)| name.as_str() != GLOBALS_MODULE)
            .chain(self.modules.iter().filter(|(name, _)| name.as_str() == GLOBALS_MODULE));
        for (name, table) in order {
            self.walk_paths(*table, vec![name.clone()], &mut visited, &mut paths);
        }
        NativeIndex { paths, tables: visited }
    }

    fn walk_paths(
        &self,
        table: ObjRef,
        path: Vec<String>,
        visited: &mut HashSet<ObjRef>,
        paths: &mut HashMap<Native, Vec<String>>,
    ) {
        if path.len() > MAX_PATH_DEPTH || !visited.insert(table) {
            return;
        }
        let Ok(t) = self.heap.table(table) else {
            return;
        };
        for (key, value) in t.entries() {
            let Key::Str(name) = key else {
                continue;
            };
            let mut next = path.clone();
            next.push(name.to_string());
            match value {
                Value::Native(native) => {
                    paths.entry(*native).or_insert(next);
                }
                Value::Table(sub) => self.walk_paths(*sub, next, visited, paths),
                _ => {}
            }
        }
    }

    pub fn resolve_native_path(&self, path: &[String]) -> Option<Native> {
        let (first, rest) = path.split_first()?;
        let mut current = Value::Table(self.module(first)?);
        for key in rest {
            let Value::Table(table) = current else {
                return None;
            };
            current = self.field(table, key).ok()?;
        }
        match current {
            Value::Native(native) => Some(native),
            _ => None,
        }
    }

    // === Mailbox queue ===

    pub fn enqueue_message(&mut self, message: Vec<Value>) {
        self.messages.push_back(message);
    }

    pub fn front_message(&self) -> Option<&[Value]> {
        self.messages.front().map(|m| m.as_slice())
    }

    pub fn pop_message(&mut self) -> Option<Vec<Value>> {
        let message = self.messages.pop_front();
        if self.heap.allocated_since_gc() >= self.gc_threshold {
            self.collect_garbage();
        }
        message
    }

    pub fn queued_messages(&self) -> usize {
        self.messages.len()
    }

    // === Lifecycle ===

    fn roots(&self) -> Vec<ObjRef> {
        let mut roots = vec![self.globals];
        roots.extend(self.modules.values().copied());
        roots.extend(self.stack.iter().filter_map(Value::object));
        roots.extend(self.outbox.iter().filter_map(Value::object));
        for message in &self.messages {
            roots.extend(message.iter().filter_map(Value::object));
        }
        for frame in &self.frames {
            roots.push(frame.closure);
            roots.extend(frame.cells.iter().flatten().copied());
        }
        roots
    }

    /// Free everything unreachable from the isolate's own roots.
    ///
    /// Values held only by the embedding host are not roots; pass them through
    /// `collect_garbage_with` to keep them alive.
    pub fn collect_garbage(&mut self) -> usize {
        self.collect_garbage_with(&[])
    }

    pub fn collect_garbage_with(&mut self, keep: &[Value]) -> usize {
        let mut roots = self.roots();
        roots.extend(keep.iter().filter_map(Value::object));
        self.heap.collect(roots)
    }

    pub(crate) fn gc_due(&self) -> bool {
        self.heap.allocated_since_gc() >= self.gc_threshold
    }

    /// Prepare a finished isolate for reuse by another process.
    ///
    /// Module bindings in the globals are restored from the module registry;
    /// other globals survive.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.outbox.clear();
        self.messages.clear();
        self.pending_results = None;
        self.native_paths = None;
        let globals = self.globals;
        if let Ok(table) = self.heap.table_mut(globals) {
            for (name, module) in &self.modules {
                if name != GLOBALS_MODULE {
                    table.set(Key::from(name.as_str()), Value::Table(*module));
                }
            }
        }
        self.collect_garbage();
    }
}

impl Default for Isolate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(_: &mut Isolate, _: Vec<Value>) -> Result<NativeReturn, String> {
        Ok(NativeReturn::one(Value::Int(42)))
    }

    fn other(_: &mut Isolate, _: Vec<Value>) -> Result<NativeReturn, String> {
        Ok(NativeReturn::none())
    }

    #[test]
    fn test_native_path_prefers_named_module() {
        let mut isolate = Isolate::new();
        isolate.register_natives("math", &[("answer", answer)]).unwrap();
        let path = isolate.native_path(Native::new("answer", answer)).unwrap();
        assert_eq!(path, vec!["math".to_string(), "answer".to_string()]);
        assert!(isolate.native_path(Native::new("other", other)).is_none());
    }

    #[test]
    fn test_native_path_nested_and_resolve() {
        let mut isolate = Isolate::new();
        let outer = isolate.new_table();
        let inner = isolate.new_table();
        isolate.set_field(inner, "answer", Value::Native(Native::new("answer", answer))).unwrap();
        isolate.set_field(outer, "deep", Value::Table(inner)).unwrap();
        isolate.register_module("outer", outer).unwrap();

        let path = isolate.native_path(Native::new("answer", answer)).unwrap();
        assert_eq!(path, vec!["outer", "deep", "answer"]);
        assert_eq!(isolate.resolve_native_path(&path), Some(Native::new("answer", answer)));
        assert_eq!(isolate.resolve_native_path(&["outer".to_string(), "missing".to_string()]), None);
    }

    #[test]
    fn test_native_path_follows_nested_writes() {
        let mut isolate = Isolate::new();
        let outer = isolate.new_table();
        let inner = isolate.new_table();
        isolate.set_field(outer, "deep", Value::Table(inner)).unwrap();
        isolate.register_module("outer", outer).unwrap();
        assert!(isolate.native_path(Native::new("answer", answer)).is_none());

        isolate.set_field(inner, "answer", Value::Native(Native::new("answer", answer))).unwrap();
        let path = isolate.native_path(Native::new("answer", answer)).unwrap();
        assert_eq!(path, vec!["outer", "deep", "answer"]);

        isolate.set_field(inner, "answer", Value::Nil).unwrap();
        assert!(isolate.native_path(Native::new("answer", answer)).is_none());
    }

    #[test]
    fn test_module_registration_binds_global() {
        let mut isolate = Isolate::new();
        let table = isolate.register_natives("tools", &[("answer", answer)]).unwrap();
        assert_eq!(isolate.get_global("tools").unwrap(), Value::Table(table));
        assert_eq!(isolate.module_name_of(table), Some("tools"));
        assert_eq!(isolate.module_name_of(isolate.globals()), Some(GLOBALS_MODULE));
    }

    #[test]
    fn test_upvalues_start_nil_except_globals() {
        let mut isolate = Isolate::new();
        let proto = Proto {
            name: "f".to_string(),
            params: 0,
            locals: 0,
            captures: vec![Capture::Upvalue(0), Capture::Globals],
            constants: vec![],
            code: vec![Op::Return(0)],
            children: vec![],
        };
        let Value::Function(f) = isolate.load_proto(proto).unwrap() else {
            panic!("expected a closure");
        };
        assert_eq!(isolate.upvalue(f, 0).unwrap(), Value::Nil);
        assert_eq!(isolate.upvalue(f, 1).unwrap(), Value::Table(isolate.globals()));
        isolate.set_upvalue(f, 0, Value::Int(7)).unwrap();
        assert_eq!(isolate.upvalue(f, 0).unwrap(), Value::Int(7));
        assert!(isolate.upvalue(f, 2).is_err());
    }

    #[test]
    fn test_denied_handle_is_unusable() {
        let mut isolate = Isolate::new();
        let Value::Handle(h) = isolate.new_handle("blob", vec![1, 2, 3]) else {
            panic!("expected a handle");
        };
        assert_eq!(isolate.handle_bytes(h).unwrap(), &[1, 2, 3]);
        isolate.deny_handle(h).unwrap();
        assert!(matches!(isolate.handle_bytes(h), Err(TransferError::HandleAlreadyTransferred)));
    }

    #[test]
    fn test_reset_keeps_globals_and_drops_garbage() {
        let mut isolate = Isolate::new();
        let tools = isolate.register_natives("tools", &[("answer", answer)]).unwrap();
        isolate.set_global("kept", Value::Int(1)).unwrap();
        isolate.set_global("tools", Value::Nil).unwrap();
        let scratch = isolate.new_table();
        isolate.push(Value::Table(scratch));
        isolate.reset();
        assert_eq!(isolate.stack_len(), 0);
        assert_eq!(isolate.get_global("kept").unwrap(), Value::Int(1));
        assert_eq!(isolate.get_global("tools").unwrap(), Value::Table(tools));
        assert!(isolate.heap().table(scratch).is_err());
    }
}
