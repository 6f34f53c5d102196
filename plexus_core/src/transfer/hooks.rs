use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Direction;
use crate::error::PlexusError;
use crate::isolate::{Isolate, ObjRef};

/// Custom copy logic for one handle type.
///
/// A hook must push exactly one handle onto the destination stack and leave
/// the source stack as it found it.
pub type HandleHook = Arc<dyn Fn(&mut HookContext<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct HandleHooks {
    pub send: HandleHook,
    pub recv: HandleHook,
}

impl HandleHooks {
    pub fn new<S, R>(send: S, recv: R) -> Self
    where
        S: Fn(&mut HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
        R: Fn(&mut HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            send: Arc::new(send),
            recv: Arc::new(recv),
        }
    }
}

impl fmt::Debug for HandleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandleHooks")
    }
}

/// What a hook sees while one handle crosses isolates.
pub struct HookContext<'a> {
    direction: Direction,
    type_name: &'a str,
    handle: ObjRef,
    source: &'a mut Isolate,
    destination: &'a mut Isolate,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        direction: Direction,
        type_name: &'a str,
        handle: ObjRef,
        source: &'a mut Isolate,
        destination: &'a mut Isolate,
    ) -> Self {
        Self {
            direction,
            type_name,
            handle,
            source,
            destination,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn type_name(&self) -> &str {
        self.type_name
    }

    pub fn handle(&self) -> ObjRef {
        self.handle
    }

    pub fn source(&self) -> &Isolate {
        self.source
    }

    /// Byte block behind the handle being transferred.
    pub fn source_bytes(&self) -> Result<&[u8], String> {
        Ok(&self.source.heap.handle(self.handle)?.block)
    }

    /// Push a handle of the transferred type onto the destination stack.
    pub fn push_handle(&mut self, block: Vec<u8>) {
        let handle = self.destination.new_handle(self.type_name, block);
        self.destination.push(handle);
    }
}

/// Process-wide map from handle type name to its hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, HandleHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_name: &str, hooks: HandleHooks) -> Result<(), PlexusError> {
        let mut map = self.hooks.write();
        if map.contains_key(type_name) {
            return Err(PlexusError::HookConflict {
                type_name: type_name.to_string(),
            });
        }
        map.insert(type_name.to_string(), hooks);
        Ok(())
    }

    /// Register several types at once. Nothing is registered if any name is taken.
    pub fn register_table(&self, table: Vec<(String, HandleHooks)>) -> Result<(), PlexusError> {
        let mut map = self.hooks.write();
        let mut seen = std::collections::HashSet::new();
        for (type_name, _) in &table {
            if map.contains_key(type_name) || !seen.insert(type_name.as_str()) {
                return Err(PlexusError::HookConflict {
                    type_name: type_name.clone(),
                });
            }
        }
        map.extend(table);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<HandleHooks> {
        self.hooks.read().get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.hooks.read().contains_key(type_name)
    }
}
