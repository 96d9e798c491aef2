// Glimmer compiler heap
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
//
// Mark-and-sweep GC (§4.2) over an intrusive linked list of erased
// `GcHeader` pointers, with a capacity-bounded per-type free-list pool for
// arrays/maps/strings so a hot allocation site (e.g. a loop building a
// table every iteration) reuses memory instead of round-tripping through
// the global allocator on every sweep.
use crate::common::hash::HashKey;
use crate::common::object::{
    ErrorObject, GcArray, GcBox, GcHeader, GcMap, GcRef, GcString, NativeFunction, ObjectKind,
    ScriptFunction, Value,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Arrays/maps at or below this element count, and strings at or below this
/// byte capacity, are eligible for pooling (§4.2 "Pools").
const POOLABLE_ELEMENTS: usize = 1024;
const POOLABLE_STRING_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct GcConfig {
    pub pool_capacity: usize,
    pub sweep_threshold_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig { pool_capacity: 2048, sweep_threshold_bytes: 1024 * 1024 }
    }
}

pub struct Heap {
    all_objects: *mut GcHeader,
    string_pool: Vec<NonNull<GcBox<GcString>>>,
    array_pool: Vec<NonNull<GcBox<GcArray>>>,
    map_pool: Vec<NonNull<GcBox<GcMap>>>,
    config: GcConfig,
    pub total_allocated: usize,
    pub max_allocated: usize,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            all_objects: std::ptr::null_mut(),
            string_pool: Vec::new(),
            array_pool: Vec::new(),
            map_pool: Vec::new(),
            config,
            total_allocated: 0,
            max_allocated: 0,
        }
    }

    fn link(&mut self, header: *mut GcHeader) {
        unsafe {
            (*header).next.set(self.all_objects);
        }
        self.all_objects = header;
    }

    fn fresh_box<T>(kind: ObjectKind, data: T) -> NonNull<GcBox<T>> {
        let boxed = Box::new(GcBox {
            header: GcHeader { kind, marked: Cell::new(false), next: Cell::new(std::ptr::null_mut()) },
            data,
        });
        NonNull::new(Box::into_raw(boxed)).unwrap()
    }

    pub fn alloc_string(&mut self, s: String) -> GcRef<GcString> {
        let size = std::mem::size_of::<GcBox<GcString>>() + s.capacity();
        let ptr = if s.capacity() <= POOLABLE_STRING_CAPACITY {
            if let Some(reused) = self.string_pool.pop() {
                unsafe { (*reused.as_ptr()).data.data = s };
                reused
            } else {
                Self::fresh_box(ObjectKind::Str, GcString { data: s })
            }
        } else {
            Self::fresh_box(ObjectKind::Str, GcString { data: s })
        };
        self.total_allocated += size;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> GcRef<GcArray> {
        let size = std::mem::size_of::<GcBox<GcArray>>() + items.capacity() * std::mem::size_of::<Value>();
        let ptr = if items.len() <= POOLABLE_ELEMENTS {
            if let Some(reused) = self.array_pool.pop() {
                unsafe { (*reused.as_ptr()).data.data = items };
                reused
            } else {
                Self::fresh_box(ObjectKind::Array, GcArray { data: items })
            }
        } else {
            Self::fresh_box(ObjectKind::Array, GcArray { data: items })
        };
        self.total_allocated += size;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    pub fn alloc_map(&mut self, entries: HashMap<HashKey, (Value, Value)>) -> GcRef<GcMap> {
        let size = std::mem::size_of::<GcBox<GcMap>>()
            + entries.capacity() * std::mem::size_of::<(HashKey, (Value, Value))>();
        let ptr = if entries.len() <= POOLABLE_ELEMENTS {
            if let Some(reused) = self.map_pool.pop() {
                unsafe { (*reused.as_ptr()).data.data = entries };
                reused
            } else {
                Self::fresh_box(ObjectKind::Map, GcMap { data: entries })
            }
        } else {
            Self::fresh_box(ObjectKind::Map, GcMap { data: entries })
        };
        self.total_allocated += size;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    /// Functions/natives/errors are allocated far less often than the three
    /// container kinds above (a closure is created once per `MKFUNCTION`
    /// site, not once per loop iteration), so they are not pooled — see
    /// DESIGN.md for this Open-Question resolution.
    pub fn alloc_function(&mut self, f: ScriptFunction) -> GcRef<ScriptFunction> {
        let size = std::mem::size_of::<GcBox<ScriptFunction>>()
            + f.free_vars.capacity() * std::mem::size_of::<Value>();
        let ptr = Self::fresh_box(ObjectKind::Function, f);
        self.total_allocated += size;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    pub fn alloc_native(&mut self, f: NativeFunction) -> GcRef<NativeFunction> {
        let size = std::mem::size_of::<GcBox<NativeFunction>>();
        let ptr = Self::fresh_box(ObjectKind::Native, f);
        self.total_allocated += size;
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    pub fn alloc_error(&mut self, e: ErrorObject) -> GcRef<ErrorObject> {
        let size = std::mem::size_of::<GcBox<ErrorObject>>();
        let ptr = Self::fresh_box(ObjectKind::Error, e);
        self.total_allocated += size;
        self.link(ptr.as_ptr() as *mut GcHeader);
        GcRef::from_raw(ptr)
    }

    /// §4.2 step 1: clear every record's mark before the next mark phase.
    pub fn unmark_all(&mut self) {
        unsafe {
            let mut cur = self.all_objects;
            while !cur.is_null() {
                (*cur).marked.set(false);
                cur = (*cur).next.get();
            }
        }
    }

    pub fn mark_list(&self, values: &[Value]) {
        for v in values {
            self.mark_value(v);
        }
    }

    /// §4.2 step 3: recurses through arrays' elements, maps' keys/values,
    /// and script-functions' free-vars and constant pool.
    pub fn mark_value(&self, value: &Value) {
        match value {
            Value::Str(r) => {
                self.mark_header(r.header_ptr());
            }
            Value::Array(r) => {
                if self.mark_header(r.header_ptr()) {
                    let items = unsafe { &r.as_ref().data };
                    self.mark_list(items);
                }
            }
            Value::Map(r) => {
                if self.mark_header(r.header_ptr()) {
                    let entries = unsafe { &r.as_ref().data };
                    for (k, v) in entries.values() {
                        self.mark_value(k);
                        self.mark_value(v);
                    }
                }
            }
            Value::Function(r) => {
                if self.mark_header(r.header_ptr()) {
                    let f = unsafe { r.as_ref() };
                    self.mark_list(&f.free_vars);
                    self.mark_list(&f.code.constants);
                }
            }
            Value::Native(r) => {
                self.mark_header(r.header_ptr());
            }
            Value::Error(r) => {
                self.mark_header(r.header_ptr());
            }
            Value::Null | Value::Bool(_) | Value::Fixed(_) | Value::Float(_) => {}
        }
    }

    /// Returns `true` the first time a header is marked this cycle, `false`
    /// on an already-marked header (so callers stop recursing into cycles).
    fn mark_header(&self, header: *mut GcHeader) -> bool {
        unsafe {
            if (*header).marked.get() {
                false
            } else {
                (*header).marked.set(true);
                true
            }
        }
    }

    pub fn should_sweep(&self) -> bool {
        self.total_allocated > self.config.sweep_threshold_bytes
    }

    /// §4.2 step 4: scans the object list once; dead records return to
    /// their type's pool (if not full and small enough) or are dropped and
    /// their backing allocation released.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut prev: *mut GcHeader = std::ptr::null_mut();
        let mut cur = self.all_objects;
        let mut swept_count = 0usize;
        let mut swept_bytes = 0usize;

        unsafe {
            while !cur.is_null() {
                let next = (*cur).next.get();
                if (*cur).marked.get() {
                    (*cur).marked.set(false);
                    prev = cur;
                } else {
                    if prev.is_null() {
                        self.all_objects = next;
                    } else {
                        (*prev).next.set(next);
                    }
                    swept_count += 1;
                    swept_bytes += self.reclaim(cur);
                }
                cur = next;
            }
        }

        self.total_allocated = self.total_allocated.saturating_sub(swept_bytes);
        (swept_count, swept_bytes)
    }

    unsafe fn reclaim(&mut self, header: *mut GcHeader) -> usize {
        unsafe {
            match (*header).kind {
                ObjectKind::Str => {
                    let ptr = NonNull::new_unchecked(header as *mut GcBox<GcString>);
                    let size = std::mem::size_of::<GcBox<GcString>>() + ptr.as_ref().data.data.capacity();
                    if ptr.as_ref().data.data.capacity() <= POOLABLE_STRING_CAPACITY
                        && self.string_pool.len() < self.config.pool_capacity
                    {
                        self.string_pool.push(ptr);
                    } else {
                        let _ = Box::from_raw(ptr.as_ptr());
                    }
                    size
                }
                ObjectKind::Array => {
                    let ptr = NonNull::new_unchecked(header as *mut GcBox<GcArray>);
                    let size = std::mem::size_of::<GcBox<GcArray>>()
                        + ptr.as_ref().data.data.capacity() * std::mem::size_of::<Value>();
                    if ptr.as_ref().data.data.len() <= POOLABLE_ELEMENTS
                        && self.array_pool.len() < self.config.pool_capacity
                    {
                        (*ptr.as_ptr()).data.data.clear();
                        self.array_pool.push(ptr);
                    } else {
                        let _ = Box::from_raw(ptr.as_ptr());
                    }
                    size
                }
                ObjectKind::Map => {
                    let ptr = NonNull::new_unchecked(header as *mut GcBox<GcMap>);
                    let size = std::mem::size_of::<GcBox<GcMap>>()
                        + ptr.as_ref().data.data.capacity()
                            * std::mem::size_of::<(HashKey, (Value, Value))>();
                    if ptr.as_ref().data.data.len() <= POOLABLE_ELEMENTS
                        && self.map_pool.len() < self.config.pool_capacity
                    {
                        (*ptr.as_ptr()).data.data.clear();
                        self.map_pool.push(ptr);
                    } else {
                        let _ = Box::from_raw(ptr.as_ptr());
                    }
                    size
                }
                ObjectKind::Function => {
                    let ptr = header as *mut GcBox<ScriptFunction>;
                    let size = std::mem::size_of::<GcBox<ScriptFunction>>();
                    let _ = Box::from_raw(ptr);
                    size
                }
                ObjectKind::Native => {
                    let ptr = header as *mut GcBox<NativeFunction>;
                    let size = std::mem::size_of::<GcBox<NativeFunction>>();
                    let _ = Box::from_raw(ptr);
                    size
                }
                ObjectKind::Error => {
                    let ptr = header as *mut GcBox<ErrorObject>;
                    let size = std::mem::size_of::<GcBox<ErrorObject>>();
                    let _ = Box::from_raw(ptr);
                    size
                }
            }
        }
    }

    unsafe fn reclaim_ignore_pool(&mut self, header: *mut GcHeader) {
        unsafe {
            match (*header).kind {
                ObjectKind::Str => { let _ = Box::from_raw(header as *mut GcBox<GcString>); }
                ObjectKind::Array => { let _ = Box::from_raw(header as *mut GcBox<GcArray>); }
                ObjectKind::Map => { let _ = Box::from_raw(header as *mut GcBox<GcMap>); }
                ObjectKind::Function => { let _ = Box::from_raw(header as *mut GcBox<ScriptFunction>); }
                ObjectKind::Native => { let _ = Box::from_raw(header as *mut GcBox<NativeFunction>); }
                ObjectKind::Error => { let _ = Box::from_raw(header as *mut GcBox<ErrorObject>); }
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            let mut cur = self.all_objects;
            while !cur.is_null() {
                let next = (*cur).next.get();
                self.reclaim_ignore_pool(cur);
                cur = next;
            }
            for ptr in self.string_pool.drain(..) {
                let _ = Box::from_raw(ptr.as_ptr());
            }
            for ptr in self.array_pool.drain(..) {
                let _ = Box::from_raw(ptr.as_ptr());
            }
            for ptr in self.map_pool.drain(..) {
                let _ = Box::from_raw(ptr.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_sweep_reclaims_unreachable() {
        let mut heap = Heap::new(GcConfig::default());
        let s1 = heap.alloc_string("kept".to_string());
        let _s2 = heap.alloc_string("dropped".to_string());

        heap.unmark_all();
        heap.mark_value(&Value::Str(s1));
        let (swept, _) = heap.sweep();
        assert_eq!(swept, 1);
        assert_eq!(unsafe { s1.as_ref().data.clone() }, "kept");
    }

    #[test]
    fn cyclic_array_does_not_infinite_loop() {
        let mut heap = Heap::new(GcConfig::default());
        let arr = heap.alloc_array(vec![Value::Null]);
        unsafe { arr.as_mut().data[0] = Value::Array(arr) };

        heap.unmark_all();
        heap.mark_value(&Value::Array(arr));
        let (swept, _) = heap.sweep();
        assert_eq!(swept, 0);
    }
}