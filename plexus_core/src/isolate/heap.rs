use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use generational_arena::{Arena, Index};

use super::{Key, ObjRef, Proto, Value};

/// Marker left on tables that stand in for something resolved on the way out of a mailbox.
#[derive(Clone, Debug, PartialEq)]
pub enum TableTag {
    Module(String),
    NativePath(Vec<String>),
}

#[derive(Debug, Default)]
pub struct Table {
    entries: HashMap<Key, Value>,
    pub(crate) tag: Option<TableTag>,
}

impl Table {
    pub fn get(&self, key: &Key) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: Key, value: Value) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    /// Border of the integer-keyed sequence starting at 1.
    pub fn len(&self) -> usize {
        let mut n = 0;
        while self.entries.contains_key(&Key::Int(n as i64 + 1)) {
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tag(&self) -> Option<&TableTag> {
        self.tag.as_ref()
    }
}

#[derive(Debug)]
pub struct Closure {
    pub proto: Arc<Proto>,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug)]
pub struct HandleObject {
    pub type_name: Option<String>,
    pub block: Vec<u8>,
    pub denied: bool,
}

#[derive(Debug)]
pub enum Object {
    Table(Table),
    Closure(Closure),
    /// Boxed variable shared by closures.
    Cell(Value),
    Handle(HandleObject),
    Thread(Value),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Table(_) => "table",
            Object::Closure(_) => "function",
            Object::Cell(_) => "upvalue",
            Object::Handle(_) => "handle",
            Object::Thread(_) => "thread",
        }
    }
}

#[derive(Debug, Default)]
pub struct Heap {
    arena: Arena<Object>,
    allocated_since_gc: usize,
}

macro_rules! accessor {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty, $what:expr) => {
        pub fn $get(&self, r: ObjRef) -> Result<&$ty, String> {
            match self.arena.get(r.0) {
                Some(Object::$variant(inner)) => Ok(inner),
                Some(other) => Err(format!("expected {}, found {}", $what, other.kind())),
                None => Err(format!("dangling {} reference", $what)),
            }
        }

        pub fn $get_mut(&mut self, r: ObjRef) -> Result<&mut $ty, String> {
            match self.arena.get_mut(r.0) {
                Some(Object::$variant(inner)) => Ok(inner),
                Some(other) => Err(format!("expected {}, found {}", $what, other.kind())),
                None => Err(format!("dangling {} reference", $what)),
            }
        }
    };
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.allocated_since_gc += 1;
        ObjRef(self.arena.insert(object))
    }

    pub fn alloc_table(&mut self) -> ObjRef {
        self.alloc(Object::Table(Table::default()))
    }

    pub fn alloc_cell(&mut self, value: Value) -> ObjRef {
        self.alloc(Object::Cell(value))
    }

    accessor!(table, table_mut, Table, Table, "table");
    accessor!(closure, closure_mut, Closure, Closure, "function");
    accessor!(cell, cell_mut, Cell, Value, "upvalue");
    accessor!(handle, handle_mut, Handle, HandleObject, "handle");
    accessor!(thread, thread_mut, Thread, Value, "thread");

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc
    }

    /// Mark everything reachable from `roots` and free the rest. Returns the number freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> usize {
        let mut marked: HashSet<Index> = HashSet::new();
        let mut pending: Vec<ObjRef> = roots.into_iter().collect();

        while let Some(r) = pending.pop() {
            if !marked.insert(r.0) {
                continue;
            }
            match self.arena.get(r.0) {
                Some(Object::Table(table)) => {
                    for (key, value) in table.entries() {
                        pending.extend(key.object());
                        pending.extend(value.object());
                    }
                }
                Some(Object::Closure(closure)) => pending.extend(closure.upvalues.iter().copied()),
                Some(Object::Cell(value)) | Some(Object::Thread(value)) => pending.extend(value.object()),
                Some(Object::Handle(_)) | None => {}
            }
        }

        let before = self.arena.len();
        self.arena.retain(|index, _| marked.contains(&index));
        self.allocated_since_gc = 0;
        before - self.arena.len()
    }
}
