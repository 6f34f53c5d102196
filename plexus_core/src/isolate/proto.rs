use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Result/argument count meaning "as many as there are".
pub const MULTI: u8 = u8::MAX;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
}

/// How a closure built from a prototype binds each of its upvalues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capture {
    /// Share the enclosing frame's local slot.
    Local(u16),
    /// Share one of the enclosing closure's upvalues.
    Upvalue(u16),
    /// Bind the isolate's global table.
    Globals,
}

// Stack machine operations. Jump targets are absolute instruction indices.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Nil,
    True,
    False,
    Const(u16),
    Pop,
    Dup,

    GetLocal(u16),
    SetLocal(u16),
    GetUpvalue(u16),
    SetUpvalue(u16),
    GetGlobal(u16),
    SetGlobal(u16),

    NewTable,
    GetField,
    SetField,

    Closure(u16),
    Call(u8, u8),
    Return(u8),

    Jump(u32),
    JumpIfFalse(u32),

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Lt,
    Le,
    Not,
    Concat,
    Len,
}

/// A compiled function body, the unit that crosses isolates as bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proto {
    pub name: String,
    pub params: u8,
    pub locals: u16,
    pub captures: Vec<Capture>,
    pub constants: Vec<Constant>,
    pub code: Vec<Op>,
    pub children: Vec<Arc<Proto>>,
}

impl Proto {
    /// Portable byte form of this prototype and its children.
    pub fn dump(&self) -> Result<Vec<u8>, String> {
        rmp_serde::to_vec(self).map_err(|e| format!("error dumping function '{}': {}", self.name, e))
    }

    pub fn undump(bytes: &[u8]) -> Result<Proto, String> {
        let proto: Proto = rmp_serde::from_slice(bytes).map_err(|e| format!("malformed function bytes: {}", e))?;
        proto.verify()?;
        Ok(proto)
    }

    /// Reject bodies whose operands point outside their own tables.
    pub fn verify(&self) -> Result<(), String> {
        if (self.locals as usize) < self.params as usize {
            return Err(format!("function '{}' has fewer locals than parameters", self.name));
        }
        let code_len = self.code.len() as u32;
        for op in &self.code {
            let ok = match *op {
                Op::Const(i) | Op::GetGlobal(i) | Op::SetGlobal(i) => (i as usize) < self.constants.len(),
                Op::GetLocal(i) | Op::SetLocal(i) => i < self.locals,
                Op::GetUpvalue(i) | Op::SetUpvalue(i) => (i as usize) < self.captures.len(),
                Op::Closure(i) => (i as usize) < self.children.len(),
                Op::Jump(t) | Op::JumpIfFalse(t) => t <= code_len,
                _ => true,
            };
            if !ok {
                return Err(format!("function '{}' has an out of range operand in {:?}", self.name, op));
            }
        }
        for child in &self.children {
            for capture in &child.captures {
                if let Capture::Local(slot) = capture {
                    if *slot >= self.locals {
                        return Err(format!("function '{}' captures a missing local", child.name));
                    }
                }
            }
            child.verify()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Proto {
        Proto {
            name: "sample".to_string(),
            params: 1,
            locals: 1,
            captures: vec![],
            constants: vec![Constant::Int(2)],
            code: vec![Op::GetLocal(0), Op::Const(0), Op::Mul, Op::Return(1)],
            children: vec![],
        }
    }

    #[test]
    fn test_dump_and_undump_keep_body() {
        let proto = sample();
        let bytes = proto.dump().unwrap();
        assert_eq!(Proto::undump(&bytes).unwrap(), proto);
    }

    #[test]
    fn test_undump_rejects_garbage() {
        assert!(Proto::undump(&[0xc1, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_verify_catches_bad_constant() {
        let mut proto = sample();
        proto.code.push(Op::Const(9));
        assert!(proto.verify().is_err());
    }
}
