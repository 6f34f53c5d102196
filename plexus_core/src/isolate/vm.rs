use std::sync::Arc;

use super::{Capture, Closure, Isolate, Key, NativeReturn, Object, ObjRef, Op, Proto, Request, Value, MULTI};

const MAX_FRAMES: usize = 200;

#[derive(Debug)]
pub struct Frame {
    pub(crate) closure: ObjRef,
    pub(crate) proto: Arc<Proto>,
    pub(crate) pc: usize,
    pub(crate) base: usize,
    /// Locals promoted to shared cells because a closure captured them.
    pub(crate) cells: Vec<Option<ObjRef>>,
    pub(crate) results: u8,
}

/// Why the interpreter handed control back.
#[derive(Debug)]
pub enum Exit {
    Finished(Vec<Value>),
    Failed(String),
    /// The code called into the runtime and must wait for an answer.
    Request(Request),
}

enum Step {
    Done(Vec<Value>),
    Suspend(Request),
}

impl Isolate {
    /// Call the function sitting below `nargs` arguments on top of the stack.
    pub fn start(&mut self, nargs: usize) -> Exit {
        let result = match self.call(nargs, MULTI) {
            Ok(Some(request)) => Ok(Step::Suspend(request)),
            Ok(None) if self.frames.is_empty() => Ok(Step::Done(std::mem::take(&mut self.stack))),
            Ok(None) => self.execute(),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Continue after a request, with its `nargs` reply values on top of the stack.
    pub fn resume(&mut self, nargs: usize) -> Exit {
        let split = self.stack.len().saturating_sub(nargs);
        let values = self.stack.split_off(split);
        let results = self.pending_results.take().unwrap_or(MULTI);
        self.push_results(values, results);
        if self.frames.is_empty() {
            return Exit::Finished(std::mem::take(&mut self.stack));
        }
        let result = self.execute();
        self.finish(result)
    }

    pub fn call_function(&mut self, function: Value, args: Vec<Value>) -> Exit {
        let nargs = args.len();
        self.stack.push(function);
        self.stack.extend(args);
        self.start(nargs)
    }

    fn finish(&mut self, result: Result<Step, String>) -> Exit {
        match result {
            Ok(Step::Done(values)) => Exit::Finished(values),
            Ok(Step::Suspend(request)) => Exit::Request(request),
            Err(message) => {
                self.frames.clear();
                self.stack.clear();
                self.outbox.clear();
                self.pending_results = None;
                Exit::Failed(message)
            }
        }
    }

    fn execute(&mut self) -> Result<Step, String> {
        loop {
            if self.gc_due() {
                self.collect_garbage();
            }

            let op = {
                let frame = self.frames.last_mut().ok_or("no active frame")?;
                match frame.proto.code.get(frame.pc) {
                    Some(op) => {
                        frame.pc += 1;
                        *op
                    }
                    None => Op::Return(0),
                }
            };

            match op {
                Op::Nil => self.stack.push(Value::Nil),
                Op::True => self.stack.push(Value::Bool(true)),
                Op::False => self.stack.push(Value::Bool(false)),
                Op::Const(i) => {
                    let value = self.constant(i)?;
                    self.stack.push(value);
                }
                Op::Pop => {
                    self.pop_operand()?;
                }
                Op::Dup => {
                    let value = self.peek(0).cloned().ok_or("stack underflow")?;
                    self.stack.push(value);
                }

                Op::GetLocal(i) => {
                    let value = self.get_local(i as usize)?;
                    self.stack.push(value);
                }
                Op::SetLocal(i) => {
                    let value = self.pop_operand()?;
                    self.set_local(i as usize, value)?;
                }
                Op::GetUpvalue(i) => {
                    let cell = self.frame_upvalue(i as usize)?;
                    let value = self.heap.cell(cell)?.clone();
                    self.stack.push(value);
                }
                Op::SetUpvalue(i) => {
                    let value = self.pop_operand()?;
                    let cell = self.frame_upvalue(i as usize)?;
                    *self.heap.cell_mut(cell)? = value;
                }
                Op::GetGlobal(i) => {
                    let name = self.constant(i)?;
                    let value = self.get(self.globals(), &name)?;
                    self.stack.push(value);
                }
                Op::SetGlobal(i) => {
                    let name = self.constant(i)?;
                    let value = self.pop_operand()?;
                    self.set(self.globals(), name, value)?;
                }

                Op::NewTable => {
                    let table = self.heap.alloc_table();
                    self.stack.push(Value::Table(table));
                }
                Op::GetField => {
                    let key = self.pop_operand()?;
                    let target = self.pop_operand()?;
                    let value = self.index(&target, &key)?;
                    self.stack.push(value);
                }
                Op::SetField => {
                    let value = self.pop_operand()?;
                    let key = self.pop_operand()?;
                    let target = self.pop_operand()?;
                    match target {
                        Value::Table(table) => self.set(table, key, value)?,
                        other => return Err(format!("attempt to index a {} value", other.type_name())),
                    }
                }

                Op::Closure(i) => {
                    let closure = self.make_closure(i as usize)?;
                    self.stack.push(closure);
                }
                Op::Call(nargs, results) => {
                    if let Some(request) = self.call(nargs as usize, results)? {
                        return Ok(Step::Suspend(request));
                    }
                }
                Op::Return(n) => {
                    if let Some(values) = self.return_from(n)? {
                        return Ok(Step::Done(values));
                    }
                }

                Op::Jump(target) => self.jump(target)?,
                Op::JumpIfFalse(target) => {
                    if !self.pop_operand()?.is_truthy() {
                        self.jump(target)?;
                    }
                }

                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    self.stack.push(arith(op, &a, &b)?);
                }
                Op::Eq => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    self.stack.push(Value::Bool(values_equal(&a, &b)));
                }
                Op::Lt | Op::Le => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    self.stack.push(Value::Bool(compare(op, &a, &b)?));
                }
                Op::Not => {
                    let value = self.pop_operand()?;
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                Op::Concat => {
                    let b = self.pop_operand()?;
                    let a = self.pop_operand()?;
                    let joined = format!("{}{}", concat_part(&a)?, concat_part(&b)?);
                    self.stack.push(Value::from(joined));
                }
                Op::Len => {
                    let value = self.pop_operand()?;
                    let len = match &value {
                        Value::Str(s) => s.len(),
                        Value::Table(t) => self.table_len(*t)?,
                        other => return Err(format!("attempt to get length of a {} value", other.type_name())),
                    };
                    self.stack.push(Value::Int(len as i64));
                }
            }
        }
    }

    fn pop_operand(&mut self) -> Result<Value, String> {
        self.stack.pop().ok_or_else(|| "stack underflow".to_string())
    }

    fn constant(&self, index: u16) -> Result<Value, String> {
        let frame = self.frames.last().ok_or("no active frame")?;
        let constant = frame
            .proto
            .constants
            .get(index as usize)
            .ok_or_else(|| format!("constant {} out of range", index))?;
        Ok(match constant {
            super::Constant::Nil => Value::Nil,
            super::Constant::Bool(b) => Value::Bool(*b),
            super::Constant::Int(i) => Value::Int(*i),
            super::Constant::Num(n) => Value::Num(*n),
            super::Constant::Str(s) => Value::string(s),
        })
    }

    fn get_local(&self, slot: usize) -> Result<Value, String> {
        let frame = self.frames.last().ok_or("no active frame")?;
        if let Some(Some(cell)) = frame.cells.get(slot) {
            return Ok(self.heap.cell(*cell)?.clone());
        }
        self.stack
            .get(frame.base + slot)
            .cloned()
            .ok_or_else(|| format!("local {} out of range", slot))
    }

    fn set_local(&mut self, slot: usize, value: Value) -> Result<(), String> {
        let frame = self.frames.last().ok_or("no active frame")?;
        if let Some(Some(cell)) = frame.cells.get(slot) {
            *self.heap.cell_mut(*cell)? = value;
            return Ok(());
        }
        let index = frame.base + slot;
        let target = self.stack.get_mut(index).ok_or_else(|| format!("local {} out of range", slot))?;
        *target = value;
        Ok(())
    }

    fn frame_upvalue(&self, index: usize) -> Result<ObjRef, String> {
        let frame = self.frames.last().ok_or("no active frame")?;
        self.upvalue_cell(frame.closure, index)
    }

    /// Move a local into a cell so closures and the frame share it.
    fn box_local(&mut self, slot: usize) -> Result<ObjRef, String> {
        let frame = self.frames.last_mut().ok_or("no active frame")?;
        let entry = frame.cells.get_mut(slot).ok_or_else(|| format!("local {} out of range", slot))?;
        if let Some(cell) = entry {
            return Ok(*cell);
        }
        let value = self.stack.get(frame.base + slot).cloned().unwrap_or(Value::Nil);
        let cell = self.heap.alloc_cell(value);
        *entry = Some(cell);
        Ok(cell)
    }

    fn make_closure(&mut self, child: usize) -> Result<Value, String> {
        let (proto, parent) = {
            let frame = self.frames.last().ok_or("no active frame")?;
            let proto = frame
                .proto
                .children
                .get(child)
                .cloned()
                .ok_or_else(|| format!("function {} out of range", child))?;
            (proto, frame.closure)
        };

        let mut upvalues = Vec::with_capacity(proto.captures.len());
        for capture in &proto.captures {
            let cell = match *capture {
                Capture::Local(slot) => self.box_local(slot as usize)?,
                Capture::Upvalue(index) => self.upvalue_cell(parent, index as usize)?,
                Capture::Globals => {
                    let globals = self.globals();
                    self.heap.alloc_cell(Value::Table(globals))
                }
            };
            upvalues.push(cell);
        }
        Ok(Value::Function(self.heap.alloc(Object::Closure(Closure { proto, upvalues }))))
    }

    fn call(&mut self, nargs: usize, results: u8) -> Result<Option<Request>, String> {
        let callee_at = self
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or("stack underflow in call")?;

        match self.stack[callee_at].clone() {
            Value::Function(function) => {
                if self.frames.len() >= MAX_FRAMES {
                    return Err("stack overflow".to_string());
                }
                let proto = self.heap.closure(function)?.proto.clone();
                let base = callee_at + 1;
                let params = proto.params as usize;
                if nargs > params {
                    self.stack.truncate(base + params);
                }
                let locals = proto.locals as usize;
                self.stack.resize(base + locals, Value::Nil);
                self.frames.push(Frame {
                    closure: function,
                    proto,
                    pc: 0,
                    base,
                    cells: vec![None; locals],
                    results,
                });
                Ok(None)
            }
            Value::Native(native) => {
                let args = self.stack.split_off(callee_at + 1);
                self.stack.truncate(callee_at);
                match (native.func)(self, args)? {
                    NativeReturn::Values(values) => {
                        self.push_results(values, results);
                        Ok(None)
                    }
                    NativeReturn::Request(request) => {
                        self.pending_results = Some(results);
                        Ok(Some(request))
                    }
                }
            }
            other => Err(format!("attempt to call a {} value", other.type_name())),
        }
    }

    fn return_from(&mut self, n: u8) -> Result<Option<Vec<Value>>, String> {
        let floor = {
            let frame = self.frames.last().ok_or("no active frame")?;
            frame.base + frame.proto.locals as usize
        };
        let count = if n == MULTI {
            self.stack.len().saturating_sub(floor)
        } else {
            n as usize
        };
        let start = self.stack.len().checked_sub(count).ok_or("stack underflow in return")?;
        let values = self.stack.split_off(start);

        let frame = self.frames.pop().ok_or("no active frame")?;
        self.stack.truncate(frame.base.saturating_sub(1));
        if self.frames.is_empty() {
            return Ok(Some(values));
        }
        self.push_results(values, frame.results);
        Ok(None)
    }

    fn push_results(&mut self, mut values: Vec<Value>, results: u8) {
        if results != MULTI {
            values.resize(results as usize, Value::Nil);
        }
        self.stack.extend(values);
    }

    fn jump(&mut self, target: u32) -> Result<(), String> {
        let frame = self.frames.last_mut().ok_or("no active frame")?;
        frame.pc = target as usize;
        Ok(())
    }

    fn index(&self, target: &Value, key: &Value) -> Result<Value, String> {
        match target {
            Value::Table(table) => match Key::try_from(key) {
                Ok(key) => Ok(self.heap.table(*table)?.get(&key)),
                Err(_) => Ok(Value::Nil),
            },
            other => Err(format!("attempt to index a {} value", other.type_name())),
        }
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Num(y)) | (Value::Num(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

fn arith(op: Op, a: &Value, b: &Value) -> Result<Value, String> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        let (x, y) = (*x, *y);
        return match op {
            Op::Add => Ok(Value::Int(x.wrapping_add(y))),
            Op::Sub => Ok(Value::Int(x.wrapping_sub(y))),
            Op::Mul => Ok(Value::Int(x.wrapping_mul(y))),
            Op::Div => Ok(Value::Num(x as f64 / y as f64)),
            Op::Mod => {
                if y == 0 {
                    return Err("attempt to perform 'n%0'".to_string());
                }
                let r = x.wrapping_rem(y);
                Ok(Value::Int(if r != 0 && (r ^ y) < 0 { r + y } else { r }))
            }
            _ => Err(format!("{:?} is not arithmetic", op)),
        };
    }

    let (x, y) = match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            let culprit = if a.as_num().is_none() { a } else { b };
            return Err(format!("attempt to perform arithmetic on a {} value", culprit.type_name()));
        }
    };
    Ok(Value::Num(match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Mul => x * y,
        Op::Div => x / y,
        Op::Mod => x - (x / y).floor() * y,
        _ => return Err(format!("{:?} is not arithmetic", op)),
    }))
}

fn compare(op: Op, a: &Value, b: &Value) -> Result<bool, String> {
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        _ => match (a.as_num(), b.as_num()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                return Err(format!(
                    "attempt to compare {} with {}",
                    a.type_name(),
                    b.type_name()
                ))
            }
        },
    };
    Ok(match ordering {
        Some(std::cmp::Ordering::Less) => true,
        Some(std::cmp::Ordering::Equal) => op == Op::Le,
        _ => false,
    })
}

fn concat_part(value: &Value) -> Result<String, String> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        Value::Int(_) | Value::Num(_) => Ok(super::number_to_string(value)),
        other => Err(format!("attempt to concatenate a {} value", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::ProtoBuilder;

    fn run(isolate: &mut Isolate, proto: Proto, args: Vec<Value>) -> Exit {
        let function = isolate.load_proto(proto).unwrap();
        isolate.call_function(function, args)
    }

    #[test]
    fn test_arithmetic_and_return() {
        let mut b = ProtoBuilder::new("sum", 2);
        b.get_local(0).get_local(1).op(Op::Add).int(10).op(Op::Mul).ret(1);
        let mut isolate = Isolate::new();
        match run(&mut isolate, b.build().unwrap(), vec![Value::Int(2), Value::Int(3)]) {
            Exit::Finished(values) => assert_eq!(values, vec![Value::Int(50)]),
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn test_loop_with_labels() {
        // total = 0; for i = 1..n do total = total + i end
        let mut b = ProtoBuilder::new("loop", 1);
        let total = b.local();
        let i = b.local();
        let top = b.label();
        let done = b.label();
        b.int(0).set_local(total).int(1).set_local(i);
        b.place(top);
        b.get_local(i).get_local(0).op(Op::Le).jump_if_false(done);
        b.get_local(total).get_local(i).op(Op::Add).set_local(total);
        b.get_local(i).int(1).op(Op::Add).set_local(i);
        b.jump(top);
        b.place(done);
        b.get_local(total).ret(1);

        let mut isolate = Isolate::new();
        match run(&mut isolate, b.build().unwrap(), vec![Value::Int(100)]) {
            Exit::Finished(values) => assert_eq!(values, vec![Value::Int(5050)]),
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn test_closures_share_captured_local() {
        // local n = 0; inc = function() n = n + 1 end; inc(); inc(); return n
        let mut inc = ProtoBuilder::new("inc", 0);
        let n_up = inc.capture(Capture::Local(0));
        inc.get_upvalue(n_up).int(1).op(Op::Add).set_upvalue(n_up).ret(0);

        let mut b = ProtoBuilder::new("outer", 0);
        let n = b.local();
        let f = b.local();
        b.int(0).set_local(n);
        b.closure(inc.build().unwrap()).set_local(f);
        b.get_local(f).call(0, 0);
        b.get_local(f).call(0, 0);
        b.get_local(n).ret(1);

        let mut isolate = Isolate::new();
        match run(&mut isolate, b.build().unwrap(), vec![]) {
            Exit::Finished(values) => assert_eq!(values, vec![Value::Int(2)]),
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn test_error_unwinds_isolate() {
        let mut b = ProtoBuilder::new("bad", 0);
        b.nil().int(1).op(Op::Add).ret(1);
        let mut isolate = Isolate::new();
        match run(&mut isolate, b.build().unwrap(), vec![]) {
            Exit::Failed(message) => assert!(message.contains("arithmetic on a nil value")),
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(isolate.stack_len(), 0);
    }

    #[test]
    fn test_tables_and_globals() {
        let mut b = ProtoBuilder::new("tables", 0);
        let t = b.local();
        b.op(Op::NewTable).set_local(t);
        b.get_local(t).string("x").int(5).op(Op::SetField);
        b.get_local(t).set_global("shared");
        b.get_global("shared").field("x").ret(1);

        let mut isolate = Isolate::new();
        match run(&mut isolate, b.build().unwrap(), vec![]) {
            Exit::Finished(values) => assert_eq!(values, vec![Value::Int(5)]),
            other => panic!("unexpected exit {:?}", other),
        }
        assert!(matches!(isolate.get_global("shared").unwrap(), Value::Table(_)));
    }

    #[test]
    fn test_mixed_number_semantics() {
        assert!(values_equal(&Value::Int(2), &Value::Num(2.0)));
        assert_eq!(arith(Op::Mod, &Value::Int(-7), &Value::Int(3)).unwrap(), Value::Int(2));
        assert_eq!(arith(Op::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Num(3.5));
        assert!(compare(Op::Lt, &Value::string("a"), &Value::string("b")).unwrap());
        assert!(compare(Op::Lt, &Value::Int(1), &Value::string("b")).is_err());
    }

    #[test]
    fn test_integer_modulo_by_zero() {
        let err = arith(Op::Mod, &Value::Int(5), &Value::Int(0)).unwrap_err();
        assert_eq!(err, "attempt to perform 'n%0'");
    }
}
