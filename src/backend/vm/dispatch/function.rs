// MKFUNCTION (§4.6 "Function literals", §4.9 stack-discipline table). The
// constant pool holds a prototype `ScriptFunction` with empty `free_vars`;
// this turns it into a closure by grafting on the captured values the
// enclosing scope just pushed.
use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::VirtualMachine;
use crate::common::object::{ScriptFunction, Value};

pub fn mk_function(vm: &mut VirtualMachine, const_index: usize, num_free: usize) -> Result<(), RuntimeError> {
    let prototype = vm
        .frames
        .current()
        .unwrap()
        .script()
        .code
        .constants
        .get(const_index)
        .copied()
        .ok_or_else(|| vm.runtime_error(VMError::InternalError(format!("function constant index {const_index} out of range"))))?;

    let Value::Function(proto) = prototype else {
        return Err(vm.runtime_error(VMError::InternalError(format!(
            "constant {const_index} is not a function prototype, found '{}'",
            prototype.type_name()
        ))));
    };

    let start = vm.stack.len().checked_sub(num_free).ok_or_else(|| {
        vm.runtime_error(VMError::InternalError("MKFUNCTION underflowed the data stack".into()))
    })?;
    let free_vars = vm.stack.split_off(start);

    let (name, code, num_locals, num_args) = unsafe {
        let p = proto.as_ref();
        (p.name.clone(), p.code.clone(), p.num_locals, p.num_args)
    };
    let closure = ScriptFunction { name, code, num_locals, num_args, free_vars };
    let value = Value::Function(vm.heap.alloc_function(closure));
    vm.push(value);
    Ok(())
}
