use std::sync::Arc;

use thiserror::Error;

use super::{Capture, Constant, Op, Proto};

/// Position in the code that jumps can target before it is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("function '{0}' uses too many locals")]
    TooManyLocals(String),
    #[error("function '{0}' uses too many constants")]
    TooManyConstants(String),
    #[error("function '{0}' jumps to a label that was never placed")]
    UnplacedLabel(String),
    #[error("{0}")]
    Invalid(String),
}

/// Convenient utility for generating prototypes.
///
/// Keeps track of locals, constants and labels, with methods for the
/// common stack-machine patterns. Methods chain; errors surface in `build`.
pub struct ProtoBuilder {
    name: String,
    params: u8,
    locals: u32,
    captures: Vec<Capture>,
    constants: Vec<Constant>,
    code: Vec<Op>,
    children: Vec<Arc<Proto>>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    overflow: Option<BuildError>,
}

impl ProtoBuilder {
    /// Parameters occupy the first `params` local slots.
    pub fn new(name: &str, params: u8) -> Self {
        Self {
            name: name.to_string(),
            params,
            locals: params as u32,
            captures: Vec::new(),
            constants: Vec::new(),
            code: Vec::new(),
            children: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            overflow: None,
        }
    }

    /// Allocate a fresh local slot.
    pub fn local(&mut self) -> u16 {
        let slot = self.locals;
        self.locals += 1;
        if self.locals > u16::MAX as u32 {
            self.overflow = Some(BuildError::TooManyLocals(self.name.clone()));
        }
        slot as u16
    }

    /// Declare an upvalue and return its index.
    pub fn capture(&mut self, capture: Capture) -> u16 {
        self.captures.push(capture);
        (self.captures.len() - 1) as u16
    }

    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(i) = self.constants.iter().position(|c| *c == constant) {
            return i as u16;
        }
        if self.constants.len() >= u16::MAX as usize {
            self.overflow = Some(BuildError::TooManyConstants(self.name.clone()));
            return 0;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.code.push(op);
        self
    }

    pub fn nil(&mut self) -> &mut Self {
        self.op(Op::Nil)
    }

    pub fn boolean(&mut self, b: bool) -> &mut Self {
        self.op(if b { Op::True } else { Op::False })
    }

    pub fn int(&mut self, i: i64) -> &mut Self {
        let c = self.constant(Constant::Int(i));
        self.op(Op::Const(c))
    }

    pub fn num(&mut self, n: f64) -> &mut Self {
        let c = self.constant(Constant::Num(n));
        self.op(Op::Const(c))
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let c = self.constant(Constant::Str(s.to_string()));
        self.op(Op::Const(c))
    }

    pub fn get_local(&mut self, slot: u16) -> &mut Self {
        self.op(Op::GetLocal(slot))
    }

    pub fn set_local(&mut self, slot: u16) -> &mut Self {
        self.op(Op::SetLocal(slot))
    }

    pub fn get_upvalue(&mut self, index: u16) -> &mut Self {
        self.op(Op::GetUpvalue(index))
    }

    pub fn set_upvalue(&mut self, index: u16) -> &mut Self {
        self.op(Op::SetUpvalue(index))
    }

    pub fn get_global(&mut self, name: &str) -> &mut Self {
        let c = self.constant(Constant::Str(name.to_string()));
        self.op(Op::GetGlobal(c))
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        let c = self.constant(Constant::Str(name.to_string()));
        self.op(Op::SetGlobal(c))
    }

    /// `t.name` with `t` already on the stack.
    pub fn field(&mut self, name: &str) -> &mut Self {
        self.string(name).op(Op::GetField)
    }

    /// Load `module.name` from the globals.
    pub fn module_fn(&mut self, module: &str, name: &str) -> &mut Self {
        self.get_global(module).field(name)
    }

    pub fn call(&mut self, nargs: u8, results: u8) -> &mut Self {
        self.op(Op::Call(nargs, results))
    }

    pub fn ret(&mut self, n: u8) -> &mut Self {
        self.op(Op::Return(n))
    }

    /// Nest `child` and push a closure over it.
    pub fn closure(&mut self, child: Proto) -> &mut Self {
        self.children.push(Arc::new(child));
        let index = (self.children.len() - 1) as u16;
        self.op(Op::Closure(index))
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn place(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len() as u32);
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.fixups.push((self.code.len(), label));
        self.op(Op::Jump(0))
    }

    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.fixups.push((self.code.len(), label));
        self.op(Op::JumpIfFalse(0))
    }

    pub fn build(&mut self) -> Result<Proto, BuildError> {
        if let Some(err) = self.overflow.take() {
            return Err(err);
        }

        let mut code = self.code.clone();
        for (at, label) in &self.fixups {
            let target = self.labels[label.0].ok_or_else(|| BuildError::UnplacedLabel(self.name.clone()))?;
            code[*at] = match code[*at] {
                Op::Jump(_) => Op::Jump(target),
                Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
                other => other,
            };
        }

        let proto = Proto {
            name: self.name.clone(),
            params: self.params,
            locals: self.locals as u16,
            captures: self.captures.clone(),
            constants: self.constants.clone(),
            code,
            children: self.children.clone(),
        };
        proto.verify().map_err(BuildError::Invalid)?;
        Ok(proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_deduplicated() {
        let mut b = ProtoBuilder::new("k", 0);
        b.string("a").string("a").int(1).ret(3);
        let proto = b.build().unwrap();
        assert_eq!(proto.constants.len(), 2);
    }

    #[test]
    fn test_labels_resolve_forward_and_back() {
        let mut b = ProtoBuilder::new("j", 0);
        let top = b.label();
        let end = b.label();
        b.place(top).boolean(false).jump_if_false(end).jump(top).place(end).ret(0);
        let proto = b.build().unwrap();
        assert_eq!(proto.code[1], Op::JumpIfFalse(3));
        assert_eq!(proto.code[2], Op::Jump(0));
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut b = ProtoBuilder::new("bad", 0);
        let nowhere = b.label();
        b.jump(nowhere);
        assert!(matches!(b.build(), Err(BuildError::UnplacedLabel(_))));
    }

    #[test]
    fn test_params_are_the_first_locals() {
        let mut b = ProtoBuilder::new("p", 2);
        assert_eq!(b.local(), 2);
        b.ret(0);
        assert_eq!(b.build().unwrap().locals, 3);
    }
}
