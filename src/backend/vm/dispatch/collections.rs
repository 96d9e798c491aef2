// MKARRAY/MAPSTART/MAPEND, GETINDEX/SETINDEX and GETVALUEAT (§4.9.1
// "Indexing", §4.6 "Arrays"/"Maps").
use crate::backend::vm::dispatch::control::{do_call, map_overload};
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::std_lib::{builtin_join, builtin_push};
use crate::backend::vm::VirtualMachine;
use crate::common::hash::HashKey;
use crate::common::object::{GcArray, GcMap, GcRef, Host, NativeFn, NativeFunction, Value};

pub fn mk_array(vm: &mut VirtualMachine, count: usize) -> Result<(), RuntimeError> {
    let start = vm.stack.len().checked_sub(count).ok_or_else(|| {
        vm.runtime_error(VMError::InternalError("MKARRAY underflowed the data stack".into()))
    })?;
    let items = vm.stack.split_off(start);
    let value = vm.alloc_array(items);
    vm.push(value);
    Ok(())
}

/// Allocates the map up front so nested field values can see it through
/// `GETTHIS` while their own bytecode runs, then leaves it on the this-stack
/// for `MAPEND` to fill in (§4.8 "this-stack", §4.6 "Maps").
pub fn map_start(vm: &mut VirtualMachine, _count: usize) -> Result<(), RuntimeError> {
    let map = vm.alloc_map(Vec::new()).expect("empty map literal is always constructible");
    vm.this_stack.push(map);
    Ok(())
}

pub fn map_end(vm: &mut VirtualMachine, count: usize) -> Result<(), RuntimeError> {
    let start = vm.stack.len().checked_sub(count * 2).ok_or_else(|| {
        vm.runtime_error(VMError::InternalError("MAPEND underflowed the data stack".into()))
    })?;
    let pairs = vm.stack.split_off(start);
    let map = vm
        .this_stack
        .pop()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError("MAPEND with an empty this-stack".into())))?;
    let Value::Map(m) = map else { unreachable!("MAPSTART always pushes a Map") };
    for pair in pairs.chunks_exact(2) {
        let (key, value) = (pair[0], pair[1]);
        let hash_key = HashKey::from_value(&key)
            .map_err(|_| vm.runtime_error(VMError::TypeError(format!("'{}' cannot be used as a map key", key.type_name()))))?;
        unsafe { m.as_mut().data.insert(hash_key, (key, value)) };
    }
    vm.push(map);
    Ok(())
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved as usize >= len { None } else { Some(resolved as usize) }
}

/// Binds `arr` as the receiver of a reused `NativeFn` (§4.9.1 "push either a
/// bound native callable ... for 'is function' entries"): the native's
/// `bound_self` is prepended to the call-site arguments by `dispatch::control
/// ::do_call`, so `func` sees exactly the `(receiver, ...args)` shape it
/// already expects as a free global.
fn bind_array_method(vm: &mut VirtualMachine, arr: GcRef<GcArray>, name: &'static str, call_site_arity: usize, func: NativeFn) -> Result<(), RuntimeError> {
    let native = vm.heap.alloc_native(NativeFunction {
        name: name.to_string(),
        arity: Some(call_site_arity),
        func,
        bound_self: Some(Value::Array(arr)),
    });
    vm.push(Value::Native(native));
    Ok(())
}

fn array_pseudo_method(vm: &mut VirtualMachine, arr: GcRef<GcArray>, name: &str) -> Option<Result<(), RuntimeError>> {
    match name {
        "length" => {
            let len = unsafe { arr.as_ref().data.len() };
            vm.push(Value::Fixed(len as i64));
            Some(Ok(()))
        }
        "push" => Some(bind_array_method(vm, arr, "push", 1, builtin_push)),
        "join" => Some(bind_array_method(vm, arr, "join", 1, builtin_join)),
        _ => None,
    }
}

pub fn get_index(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let index = vm.pop()?;
    let container = vm.pop()?;

    match container {
        Value::Array(arr) => {
            if let Value::Str(s) = index {
                let name = unsafe { s.as_ref().data.clone() };
                if let Some(outcome) = array_pseudo_method(vm, arr, &name) {
                    return outcome;
                }
                return Err(vm.runtime_error(VMError::TypeError(format!("no property or pseudo-method '{name}' on ARRAY"))));
            }
            let i = index
                .as_f64()
                .map(|f| f as i64)
                .ok_or_else(|| vm.runtime_error(VMError::TypeError(format!("array index must be a number, got '{}'", index.type_name()))))?;
            let len = unsafe { arr.as_ref().data.len() };
            let slot = normalize_index(i, len)
                .ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("array index {i} out of bounds (length {len})"))))?;
            let value = unsafe { arr.as_ref().data[slot] };
            vm.push(value);
            Ok(())
        }
        Value::Str(s) => {
            if let Value::Str(name_ref) = index {
                let name = unsafe { name_ref.as_ref().data.clone() };
                if name == "length" {
                    let len = unsafe { s.as_ref().data.chars().count() };
                    vm.push(Value::Fixed(len as i64));
                    return Ok(());
                }
                return Err(vm.runtime_error(VMError::TypeError(format!("no property or pseudo-method '{name}' on STRING"))));
            }
            let i = index
                .as_f64()
                .map(|f| f as i64)
                .ok_or_else(|| vm.runtime_error(VMError::TypeError(format!("string index must be a number, got '{}'", index.type_name()))))?;
            let chars: Vec<char> = unsafe { s.as_ref().data.chars().collect() };
            let slot = normalize_index(i, chars.len())
                .ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("string index {i} out of bounds (length {})", chars.len()))))?;
            let value = vm.alloc_string(chars[slot].to_string());
            vm.push(value);
            Ok(())
        }
        Value::Map(m) => get_map_index(vm, m, index),
        Value::Error(e) => {
            let Value::Str(name_ref) = index else {
                return Err(vm.runtime_error(VMError::TypeError(format!("error field name must be a string, got '{}'", index.type_name()))));
            };
            let name = unsafe { name_ref.as_ref().data.clone() };
            match name.as_str() {
                "message" => {
                    let value = vm.alloc_string(unsafe { e.as_ref().message.clone() });
                    vm.push(value);
                    Ok(())
                }
                "line" => {
                    vm.push(Value::Fixed(unsafe { e.as_ref().position.line } as i64));
                    Ok(())
                }
                _ => Err(vm.runtime_error(VMError::TypeError(format!("no property '{name}' on ERROR")))),
            }
        }
        other => Err(vm.runtime_error(VMError::TypeError(format!("type '{}' does not support indexing", other.type_name())))),
    }
}

fn get_map_index(vm: &mut VirtualMachine, m: GcRef<GcMap>, index: Value) -> Result<(), RuntimeError> {
    if let Ok(key) = HashKey::from_value(&index) {
        if let Some((_, value)) = unsafe { m.as_ref().data.get(&key) }.copied() {
            vm.push(value);
            return Ok(());
        }
    }
    match map_overload(m, "__getindex__") {
        Some(callee) => {
            vm.push(callee);
            vm.push(Value::Map(m));
            vm.push(index);
            do_call(vm, 2)
        }
        None => {
            vm.push(Value::Null);
            Ok(())
        }
    }
}

pub fn set_index(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let index = vm.pop()?;
    let container = vm.pop()?;
    let value = vm.pop()?;

    match container {
        Value::Array(arr) => {
            let i = index
                .as_f64()
                .map(|f| f as i64)
                .ok_or_else(|| vm.runtime_error(VMError::TypeError(format!("array index must be a number, got '{}'", index.type_name()))))?;
            let len = unsafe { arr.as_ref().data.len() };
            let slot = normalize_index(i, len)
                .ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("array index {i} out of bounds (length {len})"))))?;
            unsafe { arr.as_mut().data[slot] = value };
            Ok(())
        }
        Value::Map(m) => {
            if let Ok(key) = HashKey::from_value(&index) {
                unsafe { m.as_mut().data.insert(key, (index, value)) };
                return Ok(());
            }
            match map_overload(m, "__setindex__") {
                Some(callee) => {
                    vm.push(callee);
                    vm.push(Value::Map(m));
                    vm.push(index);
                    vm.push(value);
                    do_call(vm, 3)
                }
                None => Err(vm.runtime_error(VMError::TypeError(format!("'{}' cannot be used as a map key", index.type_name())))),
            }
        }
        other => Err(vm.runtime_error(VMError::TypeError(format!("type '{}' does not support indexed assignment", other.type_name())))),
    }
}

/// Positional access used by `foreach` (§4.6 "foreach"): arrays and strings
/// index the same way `GETINDEX` would, but maps yield a `{key, value}`
/// pair object since they have no intrinsic order to index into.
pub fn get_value_at(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let index = vm.pop()?;
    let container = vm.pop()?;
    let i = match index {
        Value::Fixed(n) if n >= 0 => n as usize,
        _ => return Err(vm.runtime_error(VMError::TypeError("foreach index must be a non-negative number".into()))),
    };

    match container {
        Value::Array(arr) => {
            let len = unsafe { arr.as_ref().data.len() };
            let value = *unsafe { &arr.as_ref().data }
                .get(i)
                .ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("array index {i} out of bounds (length {len})"))))?;
            vm.push(value);
            Ok(())
        }
        Value::Str(s) => {
            let chars: Vec<char> = unsafe { s.as_ref().data.chars().collect() };
            let c = *chars
                .get(i)
                .ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("string index {i} out of bounds (length {})", chars.len()))))?;
            let value = vm.alloc_string(c.to_string());
            vm.push(value);
            Ok(())
        }
        Value::Map(m) => {
            let entry = unsafe { &m.as_ref().data }.values().nth(i).copied();
            let (key, value) = entry.ok_or_else(|| vm.runtime_error(VMError::IndexError(format!("map entry {i} out of bounds"))))?;
            let key_name = vm.alloc_string("key".to_string());
            let value_name = vm.alloc_string("value".to_string());
            let pair = vm.alloc_map(vec![(key_name, key), (value_name, value)]).expect("string keys are always hashable");
            vm.push(pair);
            Ok(())
        }
        other => Err(vm.runtime_error(VMError::TypeError(format!("type '{}' is not iterable", other.type_name())))),
    }
}
