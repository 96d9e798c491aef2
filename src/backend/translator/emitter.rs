// Bytecode writer (§3.6, §4.5).
//
// A `CompilationScope` owns the byte-stream being built for one function
// body (the top-level module counts as a function body too), plus the
// parallel source-position stream and the break/continue jump lists that
// give `break`/`continue` something to patch once a loop's exit is known.
use crate::common::object::{SourcePos, Value};
use crate::common::opcode::Op;
use std::collections::HashMap;

pub struct CompilationScope {
    code: Vec<u8>,
    positions: Vec<SourcePos>,
    /// One entry per active loop; each entry collects the ips of `JUMP`s
    /// emitted for `break` inside that loop, patched to the loop's exit once
    /// it's known.
    break_stack: Vec<Vec<usize>>,
    /// One entry per active loop: the ip `continue` jumps back to.
    continue_stack: Vec<usize>,
    pub last_op: Option<Op>,
    pub outer: Option<Box<CompilationScope>>,
    /// §3.3: this function body's own constants pool. Function literals get
    /// their own `CompiledCode`, so each nested scope starts a fresh one.
    constants: Vec<Value>,
    string_pool: HashMap<String, usize>,
}

impl CompilationScope {
    pub fn new() -> Self {
        CompilationScope {
            code: Vec::new(),
            positions: Vec::new(),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            last_op: None,
            outer: None,
            constants: Vec::new(),
            string_pool: HashMap::new(),
        }
    }

    /// §3.3 "deduplicated for string literals via a lookup table". The
    /// scope has no heap access, so the caller (the compiler, which does)
    /// checks this first and only allocates + calls `push_string_constant`
    /// on a miss.
    pub fn string_index(&self, s: &str) -> Option<usize> {
        self.string_pool.get(s).copied()
    }

    pub fn push_string_constant(&mut self, s: &str, value: Value) -> usize {
        let ix = self.constants.len();
        self.constants.push(value);
        self.string_pool.insert(s.to_string(), ix);
        ix
    }

    /// Appends `value` (e.g. a function prototype built by `MKFUNCTION`'s
    /// caller) without deduplication, returning its index.
    pub fn add_constant(&mut self, value: Value) -> usize {
        let ix = self.constants.len();
        self.constants.push(value);
        ix
    }

    pub fn set_constant(&mut self, ix: usize, value: Value) {
        self.constants[ix] = value;
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn current_ip(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn positions(&self) -> &[SourcePos] {
        &self.positions
    }

    /// §4.5: writes the opcode byte then each operand big-endian at the
    /// opcode's fixed width, pushing `pos` once per emitted byte. Returns the
    /// ip the opcode started at, for callers that need to patch it later.
    pub fn write_op(&mut self, op: Op, operands: &[u64], pos: SourcePos) -> usize {
        let start = self.code.len();
        self.code.push(op as u8);
        self.positions.push(pos.clone());

        let widths = op.operand_widths();
        debug_assert_eq!(widths.len(), operands.len(), "operand count mismatch for {}", op.mnemonic());
        for (&width, &value) in widths.iter().zip(operands) {
            let bytes = value.to_be_bytes();
            let skip = 8 - width as usize;
            for &b in &bytes[skip..] {
                self.code.push(b);
                self.positions.push(pos.clone());
            }
        }

        self.last_op = Some(op);
        start
    }

    pub fn write_op_unknown(&mut self, op: Op, sentinel: u16, pos: SourcePos) -> usize {
        self.write_op(op, &[sentinel as u64], pos)
    }

    /// §4.5 "Patching": overwrite the two bytes starting at `ip` with the
    /// big-endian encoding of `value`.
    pub fn mod_u16_operand(&mut self, ip: usize, value: u16) {
        let bytes = value.to_be_bytes();
        self.code[ip] = bytes[0];
        self.code[ip + 1] = bytes[1];
    }

    pub fn enter_loop(&mut self, continue_ip: usize) {
        self.continue_stack.push(continue_ip);
        self.break_stack.push(Vec::new());
    }

    pub fn add_break(&mut self, jump_ip: usize) {
        self.break_stack.last_mut().expect("break outside a loop").push(jump_ip);
    }

    pub fn current_continue(&self) -> Option<usize> {
        self.continue_stack.last().copied()
    }

    pub fn in_loop(&self) -> bool {
        !self.continue_stack.is_empty()
    }

    /// Pops the loop context, patching every collected break jump's u16
    /// operand to `exit_ip`.
    pub fn exit_loop(&mut self, exit_ip: usize) {
        self.continue_stack.pop();
        let breaks = self.break_stack.pop().unwrap_or_default();
        for ip in breaks {
            // A `JUMP`'s opcode byte is at `ip`; its operand starts one byte later.
            self.mod_u16_operand(ip + 1, exit_ip as u16);
        }
    }

    /// Pushes a fresh scope for a nested function body, keeping `self` as
    /// its `outer` link.
    pub fn push_function(self) -> CompilationScope {
        let mut inner = CompilationScope::new();
        inner.outer = Some(Box::new(self));
        inner
    }

    /// Pops back to the enclosing scope, returning this scope's finished
    /// code, source positions and constants pool so the caller can build a
    /// `CompiledCode`.
    pub fn pop_function(self) -> (Vec<u8>, Vec<SourcePos>, Vec<Value>, CompilationScope) {
        let outer = *self.outer.expect("pop_function on the top-level scope");
        (self.code, self.positions, self.constants, outer)
    }
}

impl Default for CompilationScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> SourcePos {
        SourcePos::unknown()
    }

    #[test]
    fn write_op_encodes_big_endian_operand() {
        let mut scope = CompilationScope::new();
        scope.write_op(Op::Jump, &[0x1234], pos());
        assert_eq!(scope.code(), &[Op::Jump as u8, 0x12, 0x34]);
    }

    #[test]
    fn mod_u16_operand_patches_in_place() {
        let mut scope = CompilationScope::new();
        let ip = scope.write_op(Op::Jump, &[crate::common::opcode::UNPATCHED_JUMP as u64], pos());
        scope.mod_u16_operand(ip + 1, 42);
        assert_eq!(scope.code()[ip + 1..ip + 3], [0x00, 0x2a]);
    }

    #[test]
    fn break_jumps_patch_to_loop_exit() {
        let mut scope = CompilationScope::new();
        scope.enter_loop(0);
        let break_ip = scope.write_op(Op::Jump, &[crate::common::opcode::UNPATCHED_JUMP as u64], pos());
        scope.add_break(break_ip);
        scope.exit_loop(99);
        assert_eq!(scope.code()[break_ip + 1..break_ip + 3], [0x00, 0x63]);
    }
}
