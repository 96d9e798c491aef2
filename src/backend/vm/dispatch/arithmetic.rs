// ADD/SUB/MUL/DIV/MOD, bitwise/shift, unary MINUS/NOT and LEN (§4.9
// "Numeric semantics", "String concatenation", "Array append", "Operator
// overloading").
use crate::backend::vm::dispatch::control::{do_call, map_overload};
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::VirtualMachine;
use crate::common::object::Value;

#[derive(Clone, Copy)]
pub enum Arith {
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitXor,
    BitAnd,
    LShift,
    RShift,
}

impl Arith {
    fn overload_key(self) -> &'static str {
        match self {
            Arith::Sub => "__operator_sub__",
            Arith::Mul => "__operator_mul__",
            Arith::Div => "__operator_div__",
            Arith::Mod => "__operator_mod__",
            Arith::BitOr => "__operator_or__",
            Arith::BitXor => "__operator_xor__",
            Arith::BitAnd => "__operator_and__",
            Arith::LShift => "__operator_lshift__",
            Arith::RShift => "__operator_rshift__",
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
            Arith::Mod => "%",
            Arith::BitOr => "|",
            Arith::BitXor => "^",
            Arith::BitAnd => "&",
            Arith::LShift => "<<",
            Arith::RShift => ">>",
        }
    }
}

/// ECMAScript-style `ToInt32`: truncate toward zero, wrap into 32 bits.
fn to_i32(v: Value) -> Option<i32> {
    match v {
        Value::Fixed(i) => Some(i as i32),
        Value::Float(f) if f.is_finite() => Some(f as i64 as i32),
        Value::Float(_) => Some(0),
        _ => None,
    }
}

pub fn add(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    match (left, right) {
        (Value::Fixed(a), Value::Fixed(b)) => vm.push(Value::Fixed(a.wrapping_add(b))),
        (a, b) if a.is_numeric() && b.is_numeric() => {
            vm.push(Value::Float(a.as_f64().unwrap() + b.as_f64().unwrap()))
        }
        (Value::Str(a), Value::Str(b)) => {
            let combined = unsafe { format!("{}{}", a.as_ref().data, b.as_ref().data) };
            let v = Value::Str(vm.heap.alloc_string(combined));
            vm.push(v);
        }
        (Value::Str(a), other) => {
            let combined = unsafe { format!("{}{}", a.as_ref().data, other.display_string()) };
            let v = Value::Str(vm.heap.alloc_string(combined));
            vm.push(v);
        }
        (Value::Array(arr), item) => {
            unsafe { arr.as_mut().data.push(item) };
            vm.push(Value::Array(arr));
        }
        (Value::Map(m), other) => match map_overload(m, "__operator_add__") {
            Some(callee) => {
                vm.push(callee);
                vm.push(Value::Map(m));
                vm.push(other);
                do_call(vm, 2)?;
            }
            None => {
                return Err(vm.runtime_error(VMError::TypeError(format!(
                    "operator '+' is not defined between 'MAP' and '{}'",
                    other.type_name()
                ))))
            }
        },
        (a, b) => {
            return Err(vm.runtime_error(VMError::TypeError(format!(
                "operator '+' is not defined between '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))))
        }
    }
    Ok(())
}

pub fn binary(vm: &mut VirtualMachine, op: Arith) -> Result<(), RuntimeError> {
    let right = vm.pop()?;
    let left = vm.pop()?;

    if let Value::Map(m) = left {
        if let Some(callee) = map_overload(m, op.overload_key()) {
            vm.push(callee);
            vm.push(left);
            vm.push(right);
            return do_call(vm, 2);
        }
    }

    if !left.is_numeric() || !right.is_numeric() {
        return Err(vm.runtime_error(VMError::TypeError(format!(
            "operator '{}' is not defined between '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))));
    }

    let result = match op {
        Arith::Sub => numeric_widen(left, right, |a, b| a.wrapping_sub(b), |a, b| a - b),
        Arith::Mul => numeric_widen(left, right, |a, b| a.wrapping_mul(b), |a, b| a * b),
        Arith::Div => {
            if let (Value::Fixed(a), Value::Fixed(b)) = (left, right) {
                if b == 0 {
                    return Err(vm.runtime_error(VMError::ArithmeticError("division by zero".into())));
                }
                Value::Fixed(a.wrapping_div(b))
            } else {
                Value::Float(left.as_f64().unwrap() / right.as_f64().unwrap())
            }
        }
        Arith::Mod => {
            if let (Value::Fixed(a), Value::Fixed(b)) = (left, right) {
                if b == 0 {
                    return Err(vm.runtime_error(VMError::ArithmeticError("modulo by zero".into())));
                }
                Value::Fixed(a.wrapping_rem(b))
            } else {
                Value::Float(left.as_f64().unwrap() % right.as_f64().unwrap())
            }
        }
        Arith::BitOr | Arith::BitXor | Arith::BitAnd | Arith::LShift | Arith::RShift => {
            let a = to_i32(left).unwrap();
            let b = to_i32(right).unwrap();
            let bits = match op {
                Arith::BitOr => a | b,
                Arith::BitXor => a ^ b,
                Arith::BitAnd => a & b,
                Arith::LShift => a.wrapping_shl(b as u32 & 31),
                Arith::RShift => a.wrapping_shr(b as u32 & 31),
                _ => unreachable!(),
            };
            Value::Fixed(bits as i64)
        }
    };
    vm.push(result);
    Ok(())
}

fn numeric_widen(a: Value, b: Value, int_op: impl Fn(i64, i64) -> i64, float_op: impl Fn(f64, f64) -> f64) -> Value {
    match (a, b) {
        (Value::Fixed(x), Value::Fixed(y)) => Value::Fixed(int_op(x, y)),
        _ => Value::Float(float_op(a.as_f64().unwrap(), b.as_f64().unwrap())),
    }
}

pub fn minus(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    match value {
        Value::Fixed(i) => vm.push(Value::Fixed(i.wrapping_neg())),
        Value::Float(f) => vm.push(Value::Float(-f)),
        Value::Map(m) => match map_overload(m, "__operator_minus__") {
            Some(callee) => {
                vm.push(callee);
                vm.push(value);
                do_call(vm, 1)?;
            }
            None => {
                return Err(vm.runtime_error(VMError::TypeError(format!(
                    "operator '-' is not defined for type '{}'",
                    value.type_name()
                ))))
            }
        },
        other => {
            return Err(vm.runtime_error(VMError::TypeError(format!(
                "operator '-' is not defined for type '{}'",
                other.type_name()
            ))))
        }
    }
    Ok(())
}

pub fn not(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    if let Value::Map(m) = value {
        if let Some(callee) = map_overload(m, "__operator_bang__") {
            vm.push(callee);
            vm.push(value);
            return do_call(vm, 1);
        }
    }
    vm.push(Value::Bool(!value.is_truthy()));
    Ok(())
}

pub fn len(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    let length = match value {
        Value::Str(s) => unsafe { s.as_ref().data.chars().count() },
        Value::Array(a) => unsafe { a.as_ref().data.len() },
        Value::Map(m) => unsafe { m.as_ref().data.len() },
        other => {
            return Err(vm.runtime_error(VMError::TypeError(format!(
                "'length' is not defined for type '{}'",
                other.type_name()
            ))))
        }
    };
    vm.push(Value::Fixed(length as i64));
    Ok(())
}
