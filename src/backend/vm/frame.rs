// Call Frame & Frame Stack (§3.8, §4.8): one activation record per live
// call, reused from a deque instead of allocated fresh on every CALL.
use crate::common::object::{ScriptFunction, Value};

/// `{function-value, ip, base-pointer, recover-ip, is-recovering}` (§3.8).
///
/// The spec additionally caches `src-ip`/`bytecode-ptr`/`src-positions-ptr`/
/// `bc-size` on the frame so dispatch doesn't re-chase the function pointer
/// every step; here `function` already carries an `Rc<CompiledCode>`
/// (`ScriptFunction::code`), so the dispatch loop reads through it directly
/// instead of caching a second copy of the same pointer on the frame.
#[derive(Clone)]
pub struct CallFrame {
    pub function: Value,
    pub ip: usize,
    pub base_pointer: usize,
    /// `None` until `SETRECOVER` runs in this frame; `Some(ip)` is the
    /// dispatch target a propagating error unwinds to (§4.9.3).
    pub recover_ip: Option<usize>,
    pub is_recovering: bool,
}

impl CallFrame {
    pub fn new(function: Value, base_pointer: usize) -> Self {
        CallFrame { function, ip: 0, base_pointer, recover_ip: None, is_recovering: false }
    }

    /// SAFETY: `function` must be `Value::Function` — guaranteed by every
    /// construction site in `dispatch::control::call`.
    pub fn script(&self) -> &ScriptFunction {
        match &self.function {
            Value::Function(f) => unsafe { f.as_ref() },
            _ => unreachable!("call frame function is always a script function"),
        }
    }
}

/// §4.8: "if countframes equals deque length, deep-copy into a newly
/// allocated slot and append; else update the existing slot in place."
/// `slots` is the deque; `count` is the number of slots currently live —
/// `slots.len()` may exceed `count` after a pop, and those tail slots are
/// exactly the ones a subsequent `push` overwrites instead of reallocating.
pub struct FrameStack {
    slots: Vec<CallFrame>,
    count: usize,
    max_depth: usize,
}

impl FrameStack {
    pub fn new(max_depth: usize) -> Self {
        FrameStack { slots: Vec::new(), count: 0, max_depth }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Pushes `frame`, returning the data-stack pointer the VM must adopt:
    /// `frame.basepointer + function.numlocals` (§4.8).
    pub fn push(&mut self, frame: CallFrame) -> Result<usize, &'static str> {
        if self.count >= self.max_depth {
            return Err("call stack depth limit exceeded");
        }
        let new_sp = frame.base_pointer + frame.script().num_locals;
        if self.count == self.slots.len() {
            self.slots.push(frame);
        } else {
            self.slots[self.count] = frame;
        }
        self.count += 1;
        Ok(new_sp)
    }

    /// Pops the top frame, returning the data-stack pointer the VM must
    /// adopt: `current.basepointer - 1` (§4.8, discards the callee slot).
    pub fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let popped_bp = self.slots[self.count - 1].base_pointer;
        self.count -= 1;
        Some(popped_bp.saturating_sub(1))
    }

    /// Unwinds down to and including `target_index`, discarding every frame
    /// above it without touching the data stack (the caller, `recover`
    /// handling, clears the data stack itself — §4.9.3 step 2).
    pub fn truncate_to(&mut self, target_index: usize) {
        self.count = (target_index + 1).min(self.count);
    }

    pub fn current(&self) -> Option<&CallFrame> {
        if self.count == 0 { None } else { Some(&self.slots[self.count - 1]) }
    }

    pub fn current_mut(&mut self) -> Option<&mut CallFrame> {
        if self.count == 0 { None } else { Some(&mut self.slots[self.count - 1]) }
    }

    pub fn get(&self, index: usize) -> Option<&CallFrame> {
        if index < self.count { Some(&self.slots[index]) } else { None }
    }

    /// Top-down search for a frame with `recover_ip.is_some()` and
    /// `!is_recovering` (§4.9.3 step 1).
    pub fn find_recover_target(&self) -> Option<usize> {
        (0..self.count).rev().find(|&i| {
            let f = &self.slots[i];
            f.recover_ip.is_some() && !f.is_recovering
        })
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CallFrame> {
        self.slots[..self.count].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::opcode::CompiledCode;
    use std::rc::Rc;

    fn make_function(num_locals: usize) -> Value {
        use crate::common::object::{GcBox, GcHeader, GcRef, ObjectKind};
        use std::cell::Cell;
        use std::ptr::NonNull;
        let code = Rc::new(CompiledCode { code: Vec::new(), positions: Vec::new(), constants: Vec::new() });
        let f = ScriptFunction { name: None, code, num_locals, num_args: 0, free_vars: Vec::new() };
        let boxed = Box::new(GcBox {
            header: GcHeader { kind: ObjectKind::Function, marked: Cell::new(false), next: Cell::new(std::ptr::null_mut()) },
            data: f,
        });
        Value::Function(GcRef::from_raw(NonNull::new(Box::into_raw(boxed)).unwrap()))
    }

    #[test]
    fn push_sets_stack_pointer_past_locals() {
        let mut frames = FrameStack::new(8);
        let f = make_function(3);
        let sp = frames.push(CallFrame::new(f, 0)).unwrap();
        assert_eq!(sp, 3);
    }

    #[test]
    fn pop_reuses_slot_without_reallocating() {
        let mut frames = FrameStack::new(8);
        let f1 = make_function(2);
        frames.push(CallFrame::new(f1, 0)).unwrap();
        frames.pop();
        assert_eq!(frames.len(), 0);
        let f2 = make_function(5);
        let sp = frames.push(CallFrame::new(f2, 0)).unwrap();
        assert_eq!(sp, 5);
    }

    #[test]
    fn exceeding_max_depth_errors() {
        let mut frames = FrameStack::new(1);
        let f = make_function(0);
        frames.push(CallFrame::new(f, 0)).unwrap();
        let f2 = make_function(0);
        assert!(frames.push(CallFrame::new(f2, 0)).is_err());
    }
}
