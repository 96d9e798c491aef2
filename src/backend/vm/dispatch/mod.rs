mod access;
mod arithmetic;
mod collections;
mod compare;
mod control;
mod function;

use crate::backend::vm::error::{RuntimeError, VMError};
use crate::backend::vm::VirtualMachine;
use crate::common::opcode::Op;

/// Reads the operands of the opcode at `ip` (per `Op::operand_widths`) and
/// returns them widened to `u64`, plus the instruction's total width.
fn read_operands(code: &crate::common::opcode::CompiledCode, ip: usize, op: Op) -> (Vec<u64>, usize) {
    let mut operands = Vec::with_capacity(op.operand_widths().len());
    let mut cursor = ip + 1;
    for &width in op.operand_widths() {
        let value = match width {
            1 => code.read_u8(cursor) as u64,
            2 => code.read_u16(cursor) as u64,
            8 => code.read_u64(cursor),
            other => unreachable!("unsupported operand width {other}"),
        };
        operands.push(value);
        cursor += width as usize;
    }
    (operands, op.instruction_width())
}

/// Executes exactly one instruction of the current frame (§4.9 "Dispatch").
pub fn step(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let (code, ip) = {
        let frame = vm.frames.current().ok_or_else(|| {
            vm.runtime_error(VMError::InternalError("dispatch stepped with no active frame".into()))
        })?;
        (frame.script().code.clone(), frame.ip)
    };

    if ip >= code.code.len() {
        return Err(vm.runtime_error(VMError::InternalError(format!(
            "instruction pointer {ip} ran past the end of a {}-byte code blob",
            code.code.len()
        ))));
    }

    let op = Op::from_u8(code.read_u8(ip)).ok_or_else(|| {
        vm.runtime_error(VMError::InternalError(format!("unrecognized opcode byte {}", code.read_u8(ip))))
    })?;
    let (operands, width) = read_operands(&code, ip, op);

    // Every handler that wants to change control flow (jump/call/return)
    // overwrites `frame.ip` itself; pre-advancing here means a handler that
    // does nothing special automatically falls through to the next
    // instruction.
    if let Some(frame) = vm.frames.current_mut() {
        frame.ip = ip + width;
    }

    match op {
        Op::Constant => access::constant(vm, operands[0] as usize),
        Op::Null => access::push_null(vm),
        Op::True => access::push_bool(vm, true),
        Op::False => access::push_bool(vm, false),
        Op::MkNumber => access::mk_number(vm, operands[0]),
        Op::DefLocal => access::def_local(vm, operands[0] as usize),
        Op::SetLocal => access::set_local(vm, operands[0] as usize),
        Op::GetLocal => access::get_local(vm, operands[0] as usize),
        Op::DefModuleGlobal => access::def_module_global(vm, operands[0] as usize),
        Op::SetModuleGlobal => access::set_module_global(vm, operands[0] as usize),
        Op::GetModuleGlobal => access::get_module_global(vm, operands[0] as usize),
        Op::GetContextGlobal => access::get_context_global(vm, operands[0] as usize),
        Op::GetFree => access::get_free(vm, operands[0] as usize),
        Op::SetFree => access::set_free(vm, operands[0] as usize),

        Op::Pop => control::pop(vm),
        Op::Dup => control::dup(vm),
        Op::Jump => control::jump(vm, operands[0] as usize),
        Op::JumpIfFalse => control::jump_if_false(vm, operands[0] as usize),
        Op::JumpIfTrue => control::jump_if_true(vm, operands[0] as usize),
        Op::Call => control::call(vm, operands[0] as u8),
        Op::ReturnValue => control::return_value(vm),
        Op::ReturnNothing => control::return_nothing(vm),
        Op::SetRecover => control::set_recover(vm, operands[0] as usize),
        Op::CurrentFunction => control::current_function(vm),
        Op::GetThis => control::get_this(vm),

        Op::Add => arithmetic::add(vm),
        Op::Sub => arithmetic::binary(vm, arithmetic::Arith::Sub),
        Op::Mul => arithmetic::binary(vm, arithmetic::Arith::Mul),
        Op::Div => arithmetic::binary(vm, arithmetic::Arith::Div),
        Op::Mod => arithmetic::binary(vm, arithmetic::Arith::Mod),
        Op::BitOr => arithmetic::binary(vm, arithmetic::Arith::BitOr),
        Op::BitXor => arithmetic::binary(vm, arithmetic::Arith::BitXor),
        Op::BitAnd => arithmetic::binary(vm, arithmetic::Arith::BitAnd),
        Op::LShift => arithmetic::binary(vm, arithmetic::Arith::LShift),
        Op::RShift => arithmetic::binary(vm, arithmetic::Arith::RShift),
        Op::Minus => arithmetic::minus(vm),
        Op::Not => arithmetic::not(vm),
        Op::Len => arithmetic::len(vm),

        Op::ComparePlain => compare::compare_plain(vm),
        Op::CompareEqual => compare::compare_equal(vm),
        Op::IsEqual => compare::is_equal(vm),
        Op::NotEqual => compare::not_equal(vm),
        Op::GreaterThan => compare::greater_than(vm),
        Op::GreaterEqual => compare::greater_equal(vm),

        Op::MkArray => collections::mk_array(vm, operands[0] as usize),
        Op::MapStart => collections::map_start(vm, operands[0] as usize),
        Op::MapEnd => collections::map_end(vm, operands[0] as usize),
        Op::GetIndex => collections::get_index(vm),
        Op::SetIndex => collections::set_index(vm),
        Op::GetValueAt => collections::get_value_at(vm),

        Op::MkFunction => function::mk_function(vm, operands[0] as usize, operands[1] as usize),
    }
}
