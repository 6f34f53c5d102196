use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use generational_arena::Index;

use super::{Isolate, Request};

/// Reference to an object in one isolate's heap. Meaningless in any other isolate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub(crate) Index);

impl ObjRef {
    pub fn raw(&self) -> usize {
        self.0.into_raw_parts().0
    }
}

pub type NativeFn = fn(&mut Isolate, Vec<Value>) -> Result<NativeReturn, String>;

/// What a native function hands back to the interpreter.
pub enum NativeReturn {
    Values(Vec<Value>),
    /// Suspend the calling process until the runtime answers the request.
    Request(Request),
}

impl NativeReturn {
    pub fn none() -> Self {
        NativeReturn::Values(Vec::new())
    }

    pub fn one(value: Value) -> Self {
        NativeReturn::Values(vec![value])
    }
}

/// A function implemented in Rust. Identity is the function pointer.
#[derive(Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub func: NativeFn,
}

impl Native {
    pub fn new(name: &'static str, func: NativeFn) -> Self {
        Self { name, func }
    }

    pub fn addr(&self) -> usize {
        self.func as usize
    }
}

impl PartialEq for Native {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Native {}

impl Hash for Native {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Native({})", self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(Arc<str>),
    Table(ObjRef),
    Function(ObjRef),
    Native(Native),
    Handle(ObjRef),
    Thread(ObjRef),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) | Value::Native(_) => "function",
            Value::Handle(_) => "handle",
            Value::Thread(_) => "thread",
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Num(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Heap object this value points at, if any.
    pub fn object(&self) -> Option<ObjRef> {
        match self {
            Value::Table(r) | Value::Function(r) | Value::Handle(r) | Value::Thread(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

/// Hashable form of a value used as a table key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Num(u64),
    Str(Arc<str>),
    Table(ObjRef),
    Function(ObjRef),
    Native(Native),
    Handle(ObjRef),
    Thread(ObjRef),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Num(bits) => Value::Num(f64::from_bits(*bits)),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Table(r) => Value::Table(*r),
            Key::Function(r) => Value::Function(*r),
            Key::Native(n) => Value::Native(*n),
            Key::Handle(r) => Value::Handle(*r),
            Key::Thread(r) => Value::Thread(*r),
        }
    }

    pub fn object(&self) -> Option<ObjRef> {
        match self {
            Key::Table(r) | Key::Function(r) | Key::Handle(r) | Key::Thread(r) => Some(*r),
            _ => None,
        }
    }
}

impl TryFrom<&Value> for Key {
    type Error = String;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Nil => Err("table index is nil".to_string()),
            Value::Bool(b) => Ok(Key::Bool(*b)),
            Value::Int(i) => Ok(Key::Int(*i)),
            Value::Num(n) if n.is_nan() => Err("table index is NaN".to_string()),
            Value::Num(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 {
                    Ok(Key::Int(*n as i64))
                } else {
                    Ok(Key::Num(n.to_bits()))
                }
            }
            Value::Str(s) => Ok(Key::Str(s.clone())),
            Value::Table(r) => Ok(Key::Table(*r)),
            Value::Function(r) => Ok(Key::Function(*r)),
            Value::Native(n) => Ok(Key::Native(*n)),
            Value::Handle(r) => Ok(Key::Handle(*r)),
            Value::Thread(r) => Ok(Key::Thread(*r)),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(Arc::from(s))
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}
