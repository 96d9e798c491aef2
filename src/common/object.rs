// Glimmer compiler object model
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
//
// The value/object model (§3.1, §4.1): a tagged union over null, bool, the
// two numeric kinds, and five heap kinds. Heap kinds hold a `GcRef<T>` — a
// non-owning handle into GC-managed storage; the GC (see `backend::vm::gc`)
// is the only thing that ever frees the backing allocation.
use crate::common::hash::HashKey;
use crate::common::opcode::CompiledCode;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

/// Every heap allocation starts with this header so the GC can walk a single
/// intrusive linked list of erased pointers regardless of payload type, the
/// same trick the teacher's `GCObject<HeaderOnly>` cast relies on.
#[repr(C)]
pub struct GcHeader {
    pub kind: ObjectKind,
    pub marked: Cell<bool>,
    pub next: Cell<*mut GcHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Str,
    Array,
    Map,
    Function,
    Native,
    Error,
}

/// A heap object: header first (so `GcBox<T>` can be reinterpreted as a
/// `GcHeader` through a raw pointer cast) followed by the typed payload.
#[repr(C)]
pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

/// A non-owning handle to a live GC allocation. Copy, like every other
/// `Value` payload — cloning a `Value` never deep-copies heap data.
pub struct GcRef<T> {
    ptr: NonNull<GcBox<T>>,
}

impl<T> GcRef<T> {
    pub fn from_raw(ptr: NonNull<GcBox<T>>) -> Self {
        GcRef { ptr }
    }

    pub fn as_ptr(&self) -> *mut GcBox<T> {
        self.ptr.as_ptr()
    }

    pub fn header_ptr(&self) -> *mut GcHeader {
        self.ptr.as_ptr() as *mut GcHeader
    }

    /// SAFETY: caller must not hold this past a GC sweep that reclaims the
    /// object (i.e. must ensure the value remains reachable from a root).
    pub unsafe fn as_ref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }

    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut(&self) -> &mut T {
        unsafe { &mut (*self.ptr.as_ptr()).data }
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        GcRef { ptr: self.ptr }
    }
}
impl<T> Copy for GcRef<T> {}
impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr.as_ptr())
    }
}

pub struct GcString {
    pub data: String,
}

pub struct GcArray {
    pub data: Vec<Value>,
}

/// A map entry keeps the original key `Value` alongside its `HashKey`, since
/// `HashKey` throws away type distinctions that `__operator_*` overloads and
/// iteration (§4.9.1 pseudo-methods) still need to observe.
pub struct GcMap {
    pub data: std::collections::HashMap<HashKey, (Value, Value)>,
}

/// A script-level closure: shares its compiled code with every other closure
/// created from the same `MKFUNCTION` constant, but owns its own captured
/// free-variable slots (§3.1, §4.6 "Function literals").
pub struct ScriptFunction {
    pub name: Option<String>,
    pub code: Rc<CompiledCode>,
    pub num_locals: usize,
    pub num_args: usize,
    pub free_vars: Vec<Value>,
}

/// The minimal surface a native function needs from its caller: allocate
/// GC-managed strings/arrays/maps and raise a user error. Defined here
/// (rather than taking `&mut VirtualMachine` directly) so `common::object`
/// does not depend on `backend::vm`, keeping the object model a leaf module.
pub trait Host {
    fn alloc_string(&mut self, s: String) -> Value;
    fn alloc_array(&mut self, items: Vec<Value>) -> Value;
    fn alloc_map(&mut self, entries: Vec<(Value, Value)>) -> Result<Value, String>;
    fn raise(&mut self, message: String) -> Value;
}

pub type NativeFn = fn(&mut dyn Host, &[Value]) -> Value;

pub struct NativeFunction {
    pub name: String,
    pub arity: Option<usize>,
    pub func: NativeFn,
    /// Set when this native is a pseudo-method bound to a receiver (§4.9.1,
    /// e.g. `arr.push`): prepended to the call-site arguments before `func`
    /// runs, so the receiver never has to be passed explicitly.
    pub bound_self: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SourcePos {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn unknown() -> Self {
        SourcePos { file: Rc::from("<unknown>"), line: 0, column: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct TracebackFrame {
    pub name: String,
    pub position: SourcePos,
}

pub struct ErrorObject {
    pub message: String,
    pub position: SourcePos,
    pub traceback: Vec<TracebackFrame>,
}

/// A tagged value (§3.1). Heap kinds carry a `GcRef`; everything else is
/// inline. `Copy`-free on purpose: cloning a `Value` is always O(1) since
/// heap payloads are handles, not owned data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Fixed(i64),
    Float(f64),
    Str(GcRef<GcString>),
    Array(GcRef<GcArray>),
    Map(GcRef<GcMap>),
    Function(GcRef<ScriptFunction>),
    Native(GcRef<NativeFunction>),
    Error(GcRef<ErrorObject>),
}

impl Value {
    /// §4.1 truthiness: false, null, +0 (of either numeric kind) are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Fixed(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Fixed(_) | Value::Float(_))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn is_hashable(&self) -> bool {
        HashKey::from_value(self).is_ok()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Fixed(_) => "NUMBER",
            Value::Float(_) => "NUMBER",
            Value::Str(_) => "STRING",
            Value::Array(_) => "ARRAY",
            Value::Map(_) => "MAP",
            Value::Function(_) => "FUNCTION",
            Value::Native(_) => "NATIVE",
            Value::Error(_) => "ERROR",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Fixed(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// §4.1 "deep-but-shallow copy" for the non-allocating cases: closures,
    /// natives, errors and scalars are returned as-is. Containers need a
    /// fresh GC allocation and are handled by `VirtualMachine::copy_flat`.
    pub fn copy_flat_identity(&self) -> Option<Value> {
        match self {
            Value::Array(_) | Value::Map(_) | Value::Str(_) => None,
            other => Some(*other),
        }
    }

    pub fn display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Fixed(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => unsafe { s.as_ref().data.clone() },
            Value::Array(a) => {
                let items = unsafe { &a.as_ref().data };
                let parts: Vec<String> = items.iter().map(Value::display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(m) => {
                let entries = unsafe { &m.as_ref().data };
                let parts: Vec<String> = entries
                    .values()
                    .map(|(k, v)| format!("{}: {}", k.display_string(), v.display_string()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(f) => format!("function:{}", unsafe {
                f.as_ref().name.clone().unwrap_or_else(|| "<anonymous>".to_string())
            }),
            Value::Native(n) => format!("native:{}", unsafe { n.as_ref().name.clone() }),
            Value::Error(e) => format!("ERROR: {}", unsafe { e.as_ref().message.clone() }),
        }
    }
}

/// §4.9 "Number literal N ... printed ... equals N": a `float-number` with
/// no fractional part still prints the `.0` so it stays visibly distinct
/// from a `fixed-number`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}
