//! Deep copy of values between isolates.
//!
//! A transfer walks the source value, rebuilding it in the destination heap.
//! Closures cross as serialized prototypes plus their upvalues, native
//! functions and module tables cross by name, handles cross through hooks.
//! Everything copied in one message shares a single session so closures and
//! upvalue cells that alias in the source alias in the destination too.

mod hooks;

pub use hooks::*;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TransferError;
use crate::isolate::{Closure, Isolate, Key, Native, Object, ObjRef, Proto, TableTag, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Process to process.
    ToNormal,
    /// Pulled from a blocked sender by its receiver.
    FromNormal,
    /// Into an asynchronous channel's mailbox.
    ToMailbox,
    /// Out of a mailbox into a receiver.
    FromMailbox,
}

impl Direction {
    /// Outbound transfers run send hooks; inbound ones run receive hooks.
    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::ToNormal | Direction::ToMailbox)
    }

    /// Handles copied out of a mailbox leave nothing behind to deny.
    fn denies_source(self) -> bool {
        self != Direction::FromMailbox
    }
}

/// Copy the values of one message from `src` into `dst`.
///
/// On failure nothing is denied in the source and both stacks are restored to
/// their heights before the call.
pub fn transfer_message(
    src: &mut Isolate,
    values: &[Value],
    dst: &mut Isolate,
    direction: Direction,
    hooks: &HookRegistry,
    nesting_limit: usize,
) -> Result<Vec<Value>, TransferError> {
    let src_height = src.stack_len();
    let dst_height = dst.stack_len();
    let mut session = Transfer::new(hooks, direction, nesting_limit);

    let mut copied = Vec::with_capacity(values.len());
    for value in values {
        match session.value(src, value, dst, 0, "value") {
            Ok(copy) => copied.push(copy),
            Err(e) => {
                log::trace!("transfer {:?} failed: {}", direction, e);
                src.truncate_stack(src_height);
                dst.truncate_stack(dst_height);
                return Err(e);
            }
        }
    }

    for handle in session.denied {
        src.deny_handle(handle).map_err(TransferError::InvalidReference)?;
    }
    Ok(copied)
}

/// Copy a single value. Same rules as a one-value message.
pub fn transfer(
    src: &mut Isolate,
    value: &Value,
    dst: &mut Isolate,
    direction: Direction,
    hooks: &HookRegistry,
    nesting_limit: usize,
) -> Result<Value, TransferError> {
    let mut copied = transfer_message(src, std::slice::from_ref(value), dst, direction, hooks, nesting_limit)?;
    Ok(copied.pop().unwrap_or(Value::Nil))
}

/// State for one message. Dropping it is what resets the closure and cell
/// caches; table depth travels down the recursion as the `level` argument.
struct Transfer<'h> {
    hooks: &'h HookRegistry,
    direction: Direction,
    nesting_limit: usize,
    closures: HashMap<ObjRef, ObjRef>,
    cells: HashMap<ObjRef, ObjRef>,
    /// Source handles to deny once the whole message is through.
    denied: Vec<ObjRef>,
}

impl<'h> Transfer<'h> {
    fn new(hooks: &'h HookRegistry, direction: Direction, nesting_limit: usize) -> Self {
        Self {
            hooks,
            direction,
            nesting_limit,
            closures: HashMap::new(),
            cells: HashMap::new(),
            denied: Vec::new(),
        }
    }

    fn value(
        &mut self,
        src: &mut Isolate,
        value: &Value,
        dst: &mut Isolate,
        level: usize,
        position: &'static str,
    ) -> Result<Value, TransferError> {
        match value {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Num(_) | Value::Str(_) => Ok(value.clone()),
            Value::Table(table) => self.table(src, *table, dst, level + 1),
            Value::Function(function) => self.closure(src, *function, dst, level),
            Value::Native(native) => self.native(src, *native, dst),
            Value::Handle(handle) => self.handle(src, *handle, dst),
            Value::Thread(_) => Err(TransferError::UnsupportedValueKind {
                kind: value.type_name(),
                position,
            }),
        }
    }

    fn table(&mut self, src: &mut Isolate, table: ObjRef, dst: &mut Isolate, level: usize) -> Result<Value, TransferError> {
        let tag = src.heap.table(table).map_err(TransferError::InvalidReference)?.tag.clone();
        if let Some(tag) = tag {
            return resolve_tag(tag, dst);
        }

        if let Some(name) = src.module_name_of(table) {
            let name = name.to_string();
            if dst.is_mailbox() {
                return Ok(tagged(dst, TableTag::Module(name)));
            }
            return dst
                .module(&name)
                .map(Value::Table)
                .ok_or(TransferError::ModuleNotFound { name });
        }

        if level > self.nesting_limit {
            return Err(TransferError::NestingLimitExceeded {
                limit: self.nesting_limit,
            });
        }

        let entries: Vec<(Key, Value)> = src
            .heap
            .table(table)
            .map_err(TransferError::InvalidReference)?
            .entries()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let copy = dst.heap.alloc_table();
        for (key, value) in entries {
            let key = self.value(src, &key.to_value(), dst, level, "key")?;
            let value = self.value(src, &value, dst, level, "value")?;
            let key = Key::try_from(&key).map_err(TransferError::InvalidReference)?;
            dst.heap
                .table_mut(copy)
                .map_err(TransferError::InvalidReference)?
                .set(key, value);
        }
        Ok(Value::Table(copy))
    }

    fn closure(
        &mut self,
        src: &mut Isolate,
        function: ObjRef,
        dst: &mut Isolate,
        level: usize,
    ) -> Result<Value, TransferError> {
        if let Some(copy) = self.closures.get(&function) {
            return Ok(Value::Function(*copy));
        }

        let upvalues = src
            .heap
            .closure(function)
            .map_err(TransferError::InvalidReference)?
            .upvalues
            .clone();
        let bytes = src.dump_closure(function).map_err(TransferError::Serialize)?;
        let proto = Proto::undump(&bytes).map_err(TransferError::Serialize)?;

        let copy = dst.heap.alloc(Object::Closure(Closure {
            proto: Arc::new(proto),
            upvalues: Vec::with_capacity(upvalues.len()),
        }));
        // Recorded before the upvalues so closures reachable from their own upvalues resolve to this copy.
        self.closures.insert(function, copy);

        for cell in upvalues {
            let dst_cell = match self.cells.get(&cell) {
                Some(existing) => *existing,
                None => {
                    let fresh = dst.heap.alloc_cell(Value::Nil);
                    self.cells.insert(cell, fresh);
                    let content = src.heap.cell(cell).map_err(TransferError::InvalidReference)?.clone();
                    let content = self.value(src, &content, dst, level, "upvalue")?;
                    *dst.heap.cell_mut(fresh).map_err(TransferError::InvalidReference)? = content;
                    fresh
                }
            };
            dst.heap
                .closure_mut(copy)
                .map_err(TransferError::InvalidReference)?
                .upvalues
                .push(dst_cell);
        }
        Ok(Value::Function(copy))
    }

    fn native(&mut self, src: &mut Isolate, native: Native, dst: &mut Isolate) -> Result<Value, TransferError> {
        let path = src.native_path(native).ok_or_else(|| TransferError::NativeNotFound {
            name: native.name.to_string(),
        })?;
        if dst.is_mailbox() {
            return Ok(tagged(dst, TableTag::NativePath(path)));
        }
        dst.resolve_native_path(&path)
            .map(Value::Native)
            .ok_or_else(|| TransferError::NativeNotFound { name: path.join(".") })
    }

    fn handle(&mut self, src: &mut Isolate, handle: ObjRef, dst: &mut Isolate) -> Result<Value, TransferError> {
        let (type_name, denied) = {
            let object = src.heap.handle(handle).map_err(TransferError::InvalidReference)?;
            (object.type_name.clone(), object.denied)
        };
        if denied || self.denied.contains(&handle) {
            return Err(TransferError::HandleAlreadyTransferred);
        }
        let type_name = type_name.ok_or(TransferError::UntypedHandle)?;

        let src_height = src.stack_len();
        let dst_height = dst.stack_len();
        match self.hooks.get(&type_name) {
            Some(hooks) => {
                let hook = if self.direction.is_outbound() { hooks.send } else { hooks.recv };
                let mut ctx = HookContext::new(self.direction, &type_name, handle, src, dst);
                hook(&mut ctx).map_err(|message| TransferError::HookFailed {
                    type_name: type_name.clone(),
                    message,
                })?;
            }
            None => copy_handle_bytes(src, handle, &type_name, dst)?,
        }

        let violation = |detail: &str| TransferError::TransferProtocolViolation {
            type_name: type_name.clone(),
            detail: detail.to_string(),
        };
        if src.stack_len() != src_height {
            return Err(violation("source stack changed"));
        }
        if dst.stack_len() != dst_height + 1 {
            return Err(violation("expected exactly one new value on the destination stack"));
        }
        let copy = match dst.pop() {
            Some(Value::Handle(copy)) => copy,
            _ => return Err(violation("destination value is not a handle")),
        };

        if self.direction.denies_source() {
            self.denied.push(handle);
        }
        Ok(Value::Handle(copy))
    }
}

/// Default handle transfer: duplicate the byte block.
fn copy_handle_bytes(src: &Isolate, handle: ObjRef, type_name: &str, dst: &mut Isolate) -> Result<(), TransferError> {
    if !dst.is_mailbox() && !dst.has_handle_type(type_name) {
        return Err(TransferError::HandleTypeNotFound {
            type_name: type_name.to_string(),
        });
    }
    let block = src
        .heap
        .handle(handle)
        .map_err(TransferError::InvalidReference)?
        .block
        .clone();
    let copy = dst.new_handle(type_name, block);
    dst.push(copy);
    Ok(())
}

fn tagged(dst: &mut Isolate, tag: TableTag) -> Value {
    let table = dst.heap.alloc_table();
    if let Ok(t) = dst.heap.table_mut(table) {
        t.tag = Some(tag);
    }
    Value::Table(table)
}

fn resolve_tag(tag: TableTag, dst: &mut Isolate) -> Result<Value, TransferError> {
    if dst.is_mailbox() {
        return Ok(tagged(dst, tag));
    }
    match tag {
        TableTag::Module(name) => dst
            .module(&name)
            .map(Value::Table)
            .ok_or(TransferError::ModuleNotFound { name }),
        TableTag::NativePath(path) => dst
            .resolve_native_path(&path)
            .map(Value::Native)
            .ok_or_else(|| TransferError::NativeNotFound { name: path.join(".") }),
    }
}
