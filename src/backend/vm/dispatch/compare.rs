// COMPAREPLAIN/COMPAREEQUAL and their boolean-producing follow-ups (§4.9
// "Comparison semantics"). Both compare opcodes leave a signed `Fixed` on
// the stack; ISEQUAL/NOTEQUAL/GREATERTHAN/GREATEREQUAL consume it without
// re-touching the original operands.
use crate::backend::vm::dispatch::control::map_overload;
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::VirtualMachine;
use crate::common::object::{GcMap, GcRef, Value};

/// §4.1 "equality": structural for strings/arrays/maps, identity otherwise.
pub fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Fixed(x), Value::Fixed(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Fixed(x), Value::Float(y)) | (Value::Float(y), Value::Fixed(x)) => x as f64 == y,
        (Value::Str(x), Value::Str(y)) => unsafe { x.as_ref().data == y.as_ref().data },
        (Value::Array(x), Value::Array(y)) => unsafe {
            let xs = &x.as_ref().data;
            let ys = &y.as_ref().data;
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| values_equal(*p, *q))
        },
        (Value::Map(x), Value::Map(y)) => unsafe {
            let xs = &x.as_ref().data;
            let ys = &y.as_ref().data;
            xs.len() == ys.len() && xs.iter().all(|(k, (_, v))| ys.get(k).is_some_and(|(_, v2)| values_equal(*v, *v2)))
        },
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Native(x), Value::Native(y)) => x == y,
        (Value::Error(x), Value::Error(y)) => x == y,
        _ => false,
    }
}

fn ordered_cmp(vm: &mut VirtualMachine, a: Value, b: Value) -> Result<Option<i64>, RuntimeError> {
    match (a, b) {
        (x, y) if x.is_numeric() && y.is_numeric() => {
            let (fx, fy) = (x.as_f64().unwrap(), y.as_f64().unwrap());
            Ok(Some(if fx < fy { -1 } else if fx > fy { 1 } else { 0 }))
        }
        (Value::Str(x), Value::Str(y)) => unsafe {
            Ok(Some(match x.as_ref().data.cmp(&y.as_ref().data) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }))
        },
        (Value::Map(m), other) => Ok(try_cmp_overload(vm, m, Value::Map(m), other)?),
        _ => Ok(None),
    }
}

fn try_cmp_overload(
    vm: &mut VirtualMachine,
    m: GcRef<GcMap>,
    left: Value,
    right: Value,
) -> Result<Option<i64>, RuntimeError> {
    match map_overload(m, "__cmp__") {
        Some(callee) => {
            vm.push(callee);
            vm.push(left);
            vm.push(right);
            super::control::do_call(vm, 2)?;
            let result = vm.pop()?;
            Ok(result.as_f64().map(|f| f as i64))
        }
        None => Ok(None),
    }
}

pub fn compare_plain(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    match ordered_cmp(vm, left, right)? {
        Some(cmp) => vm.push(Value::Fixed(cmp)),
        None => {
            return Err(vm.runtime_error(VMError::TypeError(format!(
                "relational comparison is not defined between '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ))))
        }
    }
    Ok(())
}

pub fn compare_equal(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let eq = values_equal(left, right);
    vm.push(Value::Fixed(if eq { 0 } else { 1 }));
    Ok(())
}

fn consume_cmp(vm: &mut VirtualMachine) -> Result<i64, RuntimeError> {
    match vm.pop()? {
        Value::Fixed(n) => Ok(n),
        other => Err(vm.runtime_error(VMError::InternalError(format!(
            "expected a pending comparison result, found '{}'",
            other.type_name()
        )))),
    }
}

pub fn is_equal(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let cmp = consume_cmp(vm)?;
    vm.push(Value::Bool(cmp == 0));
    Ok(())
}

pub fn not_equal(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let cmp = consume_cmp(vm)?;
    vm.push(Value::Bool(cmp != 0));
    Ok(())
}

pub fn greater_than(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let cmp = consume_cmp(vm)?;
    vm.push(Value::Bool(cmp > 0));
    Ok(())
}

pub fn greater_equal(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let cmp = consume_cmp(vm)?;
    vm.push(Value::Bool(cmp >= 0));
    Ok(())
}
