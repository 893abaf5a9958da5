//! Process-wide handle pools.
//!
//! Strings are interned by content and never evicted; identifiers and
//! string values share the same pool, so equality is handle equality.
//! Arrays and buffers are reference-counted: copies of a handle share
//! storage, and an explicit release drops the count.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::value::{ArrayHandle, BufferHandle, RuntimeError, StrId, Value, VmType};

/// Content-keyed string interner with stable handles.
pub struct StringPool {
    inner: RwLock<StringPoolInner>,
}

#[derive(Default)]
struct StringPoolInner {
    lookup: std::collections::HashMap<Arc<str>, u32>,
    items: Vec<Arc<str>>,
}

impl StringPool {
    pub fn new() -> Self {
        let pool = StringPool {
            inner: RwLock::new(StringPoolInner::default()),
        };
        // Handle 0 is always the empty string, the default for
        // uninitialized string variables.
        pool.intern("");
        pool
    }

    /// Intern a string, returning its stable handle.
    pub fn intern(&self, text: &str) -> StrId {
        {
            let inner = self.inner.read();
            if let Some(id) = inner.lookup.get(text) {
                return StrId(*id);
            }
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.lookup.get(text) {
            return StrId(*id);
        }
        let id = inner.items.len() as u32;
        let shared: Arc<str> = Arc::from(text);
        inner.items.push(Arc::clone(&shared));
        inner.lookup.insert(shared, id);
        StrId(id)
    }

    /// Resolve a handle back to its content.
    pub fn resolve(&self, id: StrId) -> Arc<str> {
        let inner = self.inner.read();
        inner
            .items
            .get(id.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, mutable array storage.
#[derive(Debug)]
pub struct ArrayStorage {
    pub elem_type: VmType,
    pub elements: RwLock<Vec<Value>>,
}

struct ArrayEntry {
    refs: AtomicU32,
    storage: Arc<ArrayStorage>,
}

/// Reference-counted pool of arrays. Handles are value-copied; the
/// underlying storage is shared until the count drops to zero.
pub struct ArrayPool {
    entries: DashMap<u32, ArrayEntry>,
    next: AtomicU32,
}

impl ArrayPool {
    pub fn new() -> Self {
        ArrayPool {
            entries: DashMap::new(),
            next: AtomicU32::new(1), // 0 is the null handle
        }
    }

    pub fn alloc(&self, elem_type: VmType, elements: Vec<Value>) -> ArrayHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            ArrayEntry {
                refs: AtomicU32::new(1),
                storage: Arc::new(ArrayStorage {
                    elem_type,
                    elements: RwLock::new(elements),
                }),
            },
        );
        ArrayHandle(id)
    }

    pub fn get(&self, handle: ArrayHandle) -> Result<Arc<ArrayStorage>, RuntimeError> {
        self.entries
            .get(&handle.0)
            .map(|e| Arc::clone(&e.storage))
            .ok_or(RuntimeError::InvalidHandle(handle.0))
    }

    pub fn retain(&self, handle: ArrayHandle) {
        if let Some(entry) = self.entries.get(&handle.0) {
            entry.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn release(&self, handle: ArrayHandle) {
        let drop_entry = match self.entries.get(&handle.0) {
            Some(entry) => entry.refs.fetch_sub(1, Ordering::AcqRel) == 1,
            None => false,
        };
        if drop_entry {
            self.entries.remove(&handle.0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ArrayPool {
    fn default() -> Self {
        Self::new()
    }
}

struct BufferEntry {
    refs: AtomicU32,
    data: Arc<RwLock<Vec<u8>>>,
}

/// Reference-counted pool of raw byte buffers, used for extension data
/// exchange.
pub struct BufferPool {
    entries: DashMap<u32, BufferEntry>,
    next: AtomicU32,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            entries: DashMap::new(),
            next: AtomicU32::new(1),
        }
    }

    pub fn alloc(&self, data: Vec<u8>) -> BufferHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            BufferEntry {
                refs: AtomicU32::new(1),
                data: Arc::new(RwLock::new(data)),
            },
        );
        BufferHandle(id)
    }

    pub fn get(&self, handle: BufferHandle) -> Result<Arc<RwLock<Vec<u8>>>, RuntimeError> {
        self.entries
            .get(&handle.0)
            .map(|e| Arc::clone(&e.data))
            .ok_or(RuntimeError::InvalidHandle(handle.0))
    }

    pub fn retain(&self, handle: BufferHandle) {
        if let Some(entry) = self.entries.get(&handle.0) {
            entry.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn release(&self, handle: BufferHandle) {
        let drop_entry = match self.entries.get(&handle.0) {
            Some(entry) => entry.refs.fetch_sub(1, Ordering::AcqRel) == 1,
            None => false,
        };
        if drop_entry {
            self.entries.remove(&handle.0);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
