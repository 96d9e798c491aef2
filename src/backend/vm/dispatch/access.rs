// Literal pushes and every named-slot read/write: locals, module-globals,
// context-globals (Global Store) and free variables (§4.9 stack-discipline
// table, rows CONSTANT through GETFREE/SETFREE).
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::VirtualMachine;
use crate::common::object::Value;

pub fn constant(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm
        .frames
        .current()
        .unwrap()
        .script()
        .code
        .constants
        .get(index)
        .copied()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError(format!("constant index {index} out of range"))))?;
    vm.push(value);
    Ok(())
}

pub fn push_null(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    vm.push(Value::Null);
    Ok(())
}

pub fn push_bool(vm: &mut VirtualMachine, b: bool) -> Result<(), RuntimeError> {
    vm.push(Value::Bool(b));
    Ok(())
}

/// `MKNUMBER`'s operand is a bitwise-reinterpreted `f64` (§4.6 "Literals").
/// Integral literals are folded to `Value::Fixed` so later arithmetic stays
/// in the fixed lane until a float operand actually appears (§4.9 "Numeric
/// semantics").
pub fn mk_number(vm: &mut VirtualMachine, bits: u64) -> Result<(), RuntimeError> {
    let f = f64::from_bits(bits);
    let value = if f.fract() == 0.0 && f.abs() < i64::MAX as f64 { Value::Fixed(f as i64) } else { Value::Float(f) };
    vm.push(value);
    Ok(())
}

pub fn def_local(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    let slot = vm.local_slot(index)?;
    if slot >= vm.stack.len() {
        vm.stack.resize(slot + 1, Value::Null);
    }
    vm.stack[slot] = value;
    Ok(())
}

pub fn set_local(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    let slot = vm.local_slot(index)?;
    vm.stack[slot] = value;
    Ok(())
}

pub fn get_local(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let slot = vm.local_slot(index)?;
    let value = vm.stack[slot];
    vm.push(value);
    Ok(())
}

pub fn def_module_global(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    if index >= vm.module_globals.len() {
        vm.module_globals.resize(index + 1, Value::Null);
    }
    vm.module_globals[index] = value;
    Ok(())
}

pub fn set_module_global(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    if index >= vm.module_globals.len() {
        return Err(vm.runtime_error(VMError::InternalError(format!("module-global index {index} out of range"))));
    }
    vm.module_globals[index] = value;
    Ok(())
}

pub fn get_module_global(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm
        .module_globals
        .get(index)
        .copied()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError(format!("module-global index {index} out of range"))))?;
    vm.push(value);
    Ok(())
}

pub fn get_context_global(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm
        .global_store
        .get_at(index)
        .ok_or_else(|| vm.runtime_error(VMError::InternalError(format!("context-global index {index} out of range"))))?;
    vm.push(value);
    Ok(())
}

pub fn get_free(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm
        .frames
        .current()
        .unwrap()
        .script()
        .free_vars
        .get(index)
        .copied()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError(format!("free-variable index {index} out of range"))))?;
    vm.push(value);
    Ok(())
}

/// Free slots live on the closure object itself, so writing one mutates the
/// shared `ScriptFunction` every other reference to the same closure sees —
/// this is what lets the Scenario 2 closure test's `x = x + 1` persist
/// across calls to the returned inner function.
pub fn set_free(vm: &mut VirtualMachine, index: usize) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    let function = vm.frames.current().unwrap().function;
    match function {
        Value::Function(f) => {
            let script = unsafe { f.as_mut() };
            let slot = script.free_vars.get_mut(index).ok_or_else(|| {
                vm.runtime_error(VMError::InternalError(format!("free-variable index {index} out of range")))
            })?;
            *slot = value;
            Ok(())
        }
        _ => unreachable!("current frame always holds a script function"),
    }
}
