// Stack bookkeeping (POP/DUP), branches, calls/returns and the `recover`
// state-machine transition (§4.8, §4.9.2, §4.9.3).
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::frame::CallFrame;
use crate::backend::vm::VirtualMachine;
use crate::common::hash::HashKey;
use crate::common::object::{GcMap, GcRef, Value};

pub fn pop(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    vm.last_popped = value;
    Ok(())
}

pub fn dup(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let top = *vm.stack.last().ok_or_else(|| vm.runtime_error(VMError::InternalError("DUP on empty stack".into())))?;
    vm.push(top);
    Ok(())
}

pub fn jump(vm: &mut VirtualMachine, target: usize) -> Result<(), RuntimeError> {
    vm.frames.current_mut().unwrap().ip = target;
    Ok(())
}

pub fn jump_if_false(vm: &mut VirtualMachine, target: usize) -> Result<(), RuntimeError> {
    let cond = vm.pop()?;
    if !cond.is_truthy() {
        vm.frames.current_mut().unwrap().ip = target;
    }
    Ok(())
}

pub fn jump_if_true(vm: &mut VirtualMachine, target: usize) -> Result<(), RuntimeError> {
    let cond = vm.pop()?;
    if cond.is_truthy() {
        vm.frames.current_mut().unwrap().ip = target;
    }
    Ok(())
}

pub fn call(vm: &mut VirtualMachine, argc: u8) -> Result<(), RuntimeError> {
    do_call(vm, argc as usize)
}

/// §4.9.2. Stack on entry: `[..., callee, arg_0, ..., arg_{argc-1}]`.
/// Shared by the `CALL` opcode and by operator-overload / pseudo-method
/// dispatch (arithmetic, compare, collections), which push a synthetic
/// callee+args onto the stack the same way before delegating here.
pub(crate) fn do_call(vm: &mut VirtualMachine, argc: usize) -> Result<(), RuntimeError> {
    let callee_index = vm
        .stack
        .len()
        .checked_sub(argc + 1)
        .ok_or_else(|| vm.runtime_error(VMError::InternalError("CALL underflowed the data stack".into())))?;
    let callee = vm.stack[callee_index];

    match callee {
        Value::Function(f) => {
            let script = unsafe { f.as_ref() };
            if argc > script.num_args {
                return Err(vm.runtime_error(VMError::InvalidCall(format!(
                    "function '{}' takes at most {} argument(s), got {}",
                    script.name.clone().unwrap_or_else(|| "<anonymous>".to_string()),
                    script.num_args,
                    argc
                ))));
            }
            let base_pointer = callee_index + 1;
            let frame = CallFrame::new(callee, base_pointer);
            let new_sp = vm.frames.push(frame).map_err(|_| vm.runtime_error(VMError::StackOverflow))?;
            vm.stack.resize(new_sp, Value::Null);
            Ok(())
        }
        Value::Native(n) => {
            let native = unsafe { n.as_ref() };
            if let Some(arity) = native.arity {
                if arity != argc {
                    return Err(vm.runtime_error(VMError::InvalidCall(format!(
                        "'{}' expects {} argument(s), got {}",
                        native.name, arity, argc
                    ))));
                }
            }
            let mut args: Vec<Value> = Vec::with_capacity(native.bound_self.is_some() as usize + argc);
            args.extend(native.bound_self);
            args.extend_from_slice(&vm.stack[callee_index + 1..]);
            let result = (native.func)(vm, &args);
            vm.stack.truncate(callee_index);
            if let Value::Error(e) = result {
                let err = unsafe { e.as_ref() };
                return Err(RuntimeError::new(VMError::User(err.message.clone()), &err.position));
            }
            vm.push(result);
            Ok(())
        }
        Value::Map(m) => match map_overload(m, "__call__") {
            Some(replacement) => {
                vm.stack[callee_index] = replacement;
                do_call(vm, argc)
            }
            None => Err(vm.runtime_error(VMError::InvalidCall(format!(
                "object of type '{}' is not callable",
                callee.type_name()
            )))),
        },
        _ => Err(vm.runtime_error(VMError::InvalidCall(format!(
            "object of type '{}' is not callable",
            callee.type_name()
        )))),
    }
}

pub fn return_value(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm.pop()?;
    finish_return(vm, value)
}

pub fn return_nothing(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    finish_return(vm, Value::Null)
}

fn finish_return(vm: &mut VirtualMachine, value: Value) -> Result<(), RuntimeError> {
    let new_sp = vm
        .frames
        .pop()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError("RETURN with no active frame".into())))?;
    vm.stack.truncate(new_sp);
    vm.stack.push(value);
    vm.last_popped = value;
    Ok(())
}

pub fn set_recover(vm: &mut VirtualMachine, target: usize) -> Result<(), RuntimeError> {
    vm.frames.current_mut().unwrap().recover_ip = Some(target);
    Ok(())
}

pub fn current_function(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let function = vm.frames.current().unwrap().function;
    vm.push(function);
    Ok(())
}

pub fn get_this(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let value = vm
        .this_stack
        .last()
        .copied()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError("GETTHIS with an empty this-stack".into())))?;
    vm.push(value);
    Ok(())
}

/// Looks up a well-known operator-overload key on a map (§4.9 "Operator
/// overloading"). Keys are probed as transient `HashKey::Str` values rather
/// than pre-allocated heap strings, since `HashKey` equality is structural.
pub(crate) fn map_overload(map: GcRef<GcMap>, key: &str) -> Option<Value> {
    let entries = unsafe { &map.as_ref().data };
    let probe = HashKey::Str(key.to_string());
    entries.get(&probe).map(|(_, v)| *v).filter(Value::is_callable)
}
