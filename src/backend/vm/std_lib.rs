// Built-in natives registered into the Global Store at startup (§4.3
// "register-native", §6.3). Each is a plain `NativeFn`, so none of them can
// capture state — `push`/`keys`/`values` all read their receiver out of
// `args[0]` instead. `builtin_push`/`builtin_join` are also reused directly
// as the underlying `func` for the bound pseudo-methods `dispatch::collections`
// hands back from `GETINDEX` (§4.9.1) — there, `args[0]` is filled in by the
// bound native's `bound_self` rather than by the caller.
use crate::backend::vm::globals::NativeDescriptor;
use crate::common::object::{Host, Value};

pub const BUILTINS: &[NativeDescriptor] =
    &[
        NativeDescriptor { name: "len", arity: Some(1), func: builtin_len },
        NativeDescriptor { name: "print", arity: None, func: builtin_print },
        NativeDescriptor { name: "push", arity: Some(2), func: builtin_push },
        NativeDescriptor { name: "keys", arity: Some(1), func: builtin_keys },
        NativeDescriptor { name: "values", arity: Some(1), func: builtin_values },
        NativeDescriptor { name: "type", arity: Some(1), func: builtin_type },
        NativeDescriptor { name: "error", arity: Some(1), func: builtin_error },
        NativeDescriptor { name: "crash", arity: Some(1), func: builtin_error },
    ];

fn builtin_len(host: &mut dyn Host, args: &[Value]) -> Value {
    let length = match args[0] {
        Value::Str(s) => unsafe { s.as_ref().data.chars().count() },
        Value::Array(a) => unsafe { a.as_ref().data.len() },
        Value::Map(m) => unsafe { m.as_ref().data.len() },
        other => return host.raise(format!("TypeMismatchException: 'len' is not defined for type '{}'", other.type_name())),
    };
    Value::Fixed(length as i64)
}

fn builtin_print(host: &mut dyn Host, args: &[Value]) -> Value {
    let parts: Vec<String> = args.iter().map(Value::display_string).collect();
    println!("{}", parts.join(" "));
    let _ = host;
    Value::Null
}

pub(crate) fn builtin_push(host: &mut dyn Host, args: &[Value]) -> Value {
    match args[0] {
        Value::Array(arr) => {
            unsafe { arr.as_mut().data.push(args[1]) };
            args[0]
        }
        other => host.raise(format!("TypeMismatchException: 'push' is not defined for type '{}'", other.type_name())),
    }
}

/// Joins an array's elements (`display_string`-rendered) with a string
/// separator. Only reachable as the bound pseudo-method `arr.join(sep)`
/// (§4.9.1) — there is no free-function `join` in `BUILTINS`.
pub(crate) fn builtin_join(host: &mut dyn Host, args: &[Value]) -> Value {
    match (args[0], args[1]) {
        (Value::Array(arr), Value::Str(sep)) => {
            let sep = unsafe { sep.as_ref().data.clone() };
            let parts: Vec<String> = unsafe { &arr.as_ref().data }.iter().map(Value::display_string).collect();
            host.alloc_string(parts.join(&sep))
        }
        (Value::Array(_), other) => {
            host.raise(format!("TypeMismatchException: 'join' separator must be a string, got '{}'", other.type_name()))
        }
        (other, _) => host.raise(format!("TypeMismatchException: 'join' is not defined for type '{}'", other.type_name())),
    }
}

fn builtin_keys(host: &mut dyn Host, args: &[Value]) -> Value {
    match args[0] {
        Value::Map(m) => {
            let keys: Vec<Value> = unsafe { &m.as_ref().data }.values().map(|(k, _)| *k).collect();
            host.alloc_array(keys)
        }
        other => host.raise(format!("TypeMismatchException: 'keys' is not defined for type '{}'", other.type_name())),
    }
}

fn builtin_values(host: &mut dyn Host, args: &[Value]) -> Value {
    match args[0] {
        Value::Map(m) => {
            let values: Vec<Value> = unsafe { &m.as_ref().data }.values().map(|(_, v)| *v).collect();
            host.alloc_array(values)
        }
        other => host.raise(format!("TypeMismatchException: 'values' is not defined for type '{}'", other.type_name())),
    }
}

fn builtin_type(host: &mut dyn Host, args: &[Value]) -> Value {
    host.alloc_string(args[0].type_name().to_lowercase())
}

fn builtin_error(host: &mut dyn Host, args: &[Value]) -> Value {
    host.raise(args[0].display_string())
}
