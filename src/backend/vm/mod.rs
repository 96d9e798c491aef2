// Glimmer compiler VM
// Created by: Yuyang Feng <mu_yunaaaa@mail.nwpu.edu.cn>
// Changelog:
// 2026-02-15: Finalized the VM data structures and core components;
//            designed FuncMetadata to store function-related bytecode, constant pools, and register lifetime information;
//            implemented the VirtualMachine initialization process, including function extraction from IR modules, bytecode generation, and entry frame preparation;
//            introduced the dump_internal_state method for debugging and verifying VM state;
//            designed the VM register clearing mechanism to support lifetime management and GC-friendliness.
// 2026-02-17: Introduced the heap and converted string constants into GC-managed string objects;
//            ensured they are correctly processed and reclaimed during the runtime phase.
// 2026-02-18: Major Architectural Evolution:
//            [Dispatch System]: Introduced a decoupled `dispatch` module, centralizing instruction execution logic;
//            implemented a complete suite of logical comparison opcodes (LT, GT, LE, GE) with full support for Number
//            and String (lexicographical) operands; established the PC-skip pattern for conditional branching.
//            [Error Handling & Diagnostics]: Developed a robust Error Handling System with a detailed `VMError` hierarchy;
//            integrated a "Stack Traceback" mechanism to provide deep-dive diagnostics (#0 to #n frame recovery)
//            during runtime panics or type mismatches.
//            [GC & Memory Strategy]: Refined the Mark-and-Sweep algorithm to be type-aware, ensuring explicit
//            destructor (Drop) execution for Heap-allocated Strings and Tables;
//            implemented synchronized string-pool cleanup during the sweep phase to prevent dangling pointers;
//            Optimized performance by deprecating aggressive register auto-nulling in favor of a stable,
//            frame-level reclamation strategy, resolving critical "Nil" value propagation bugs during cross-instruction execution.
// 2026-02-19: Rebuilt around the stack-based Glimmer ISA (§4.9): replaced the
//            register file and FuncMetadata map with a flat data stack, a
//            this-stack for pseudo-method receivers, and a reusable frame
//            deque (`frame::FrameStack`); operator overloading and `recover`
//            are new to this revision.
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod globals;
pub mod heap;
pub mod std_lib;

use crate::common::object::{Host, ScriptFunction, SourcePos, TracebackFrame, Value};
use crate::common::opcode::CompiledCode;
use clap::ValueEnum;
use error::{RuntimeError, VMError};
use frame::{CallFrame, FrameStack};
use globals::GlobalStore;
use heap::{GcConfig, Heap};
use std::rc::Rc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Only the program's final value is printed.
    Release,
    /// Logs compile/VM lifecycle events at `log::Level::Debug`.
    Debug,
    /// Additionally dumps the bytecode listing and final VM state.
    Trace,
}

/// §7.a ambient configuration: GC pool sizing, the call-depth ceiling, and
/// the sweep threshold, gathered so the CLI (or an embedder) can override
/// any of them before constructing a `VirtualMachine`.
#[derive(Clone)]
pub struct Config {
    pub gc: GcConfig,
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { gc: GcConfig::default(), max_call_depth: 1024 }
    }
}

/// §3.9 VM State, minus the constants/overload-key tables the spec keeps as
/// separate fields: constants live on each frame's `ScriptFunction::code`
/// (shared `Rc`, so no duplication), and operator-overload keys are probed
/// as transient `HashKey::Str` values rather than precomputed GC roots,
/// since `HashKey` equality is structural, not pointer identity (see
/// DESIGN.md).
pub struct VirtualMachine {
    pub stack: Vec<Value>,
    pub this_stack: Vec<Value>,
    pub frames: FrameStack,
    /// Module-global values, indexed by `Symbol::index` for `ModuleGlobal`
    /// symbols (separate from `global_store`, which holds context-globals).
    pub module_globals: Vec<Value>,
    pub global_store: GlobalStore,
    pub heap: Heap,
    pub last_popped: Value,
    pub log_level: LogLevel,
    config: Config,
}

impl VirtualMachine {
    pub fn new(global_store: GlobalStore, config: Config) -> Self {
        let heap = Heap::new(config.gc.clone());
        VirtualMachine {
            stack: Vec::new(),
            this_stack: Vec::new(),
            frames: FrameStack::new(config.max_call_depth),
            module_globals: Vec::new(),
            global_store,
            heap,
            last_popped: Value::Null,
            log_level: LogLevel::Release,
            config,
        }
    }

    /// Runs a freshly compiled module body. `num_module_globals` reserves
    /// slots so `DEFMODULEGLOBAL`/`GETMODULEGLOBAL` addressing is in range
    /// from the first instruction.
    pub fn run(&mut self, code: Rc<CompiledCode>, num_module_globals: usize) -> Result<Value, RuntimeError> {
        if self.module_globals.len() < num_module_globals {
            self.module_globals.resize(num_module_globals, Value::Null);
        }
        let entry = ScriptFunction { name: None, code, num_locals: 0, num_args: 0, free_vars: Vec::new() };
        let entry_val = Value::Function(self.heap.alloc_function(entry));
        let frame = CallFrame::new(entry_val, self.stack.len());
        let sp = self
            .frames
            .push(frame)
            .map_err(|_| self.runtime_error(VMError::StackOverflow))?;
        self.stack.resize(sp, Value::Null);

        if matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) {
            log::debug!("VM execution started ({} module globals)", num_module_globals);
        }

        loop {
            if self.frames.is_empty() {
                break;
            }
            match dispatch::step(self) {
                Ok(()) => {}
                Err(err) => self.handle_runtime_error(err)?,
            }
            if self.heap.should_sweep() {
                self.collect();
            }
        }

        if matches!(self.log_level, LogLevel::Trace) {
            self.dump_internal_state();
        }
        Ok(self.last_popped)
    }

    /// §4.9.3: on a propagating error, search for a recover target; if one
    /// exists unwind to it and resume, else surface the error to the caller.
    fn handle_runtime_error(&mut self, err: RuntimeError) -> Result<(), RuntimeError> {
        let err = self.attach_traceback(err);
        match self.frames.find_recover_target() {
            None => Err(err),
            Some(target_index) => {
                let recover_ip = self.frames.get(target_index).and_then(|f| f.recover_ip).unwrap();
                let target_bp = self.frames.get(target_index).unwrap().base_pointer;
                self.frames.truncate_to(target_index);
                self.stack.truncate(target_bp);

                let error_obj = crate::common::object::ErrorObject {
                    message: err.kind.to_string(),
                    position: err.position(),
                    traceback: err.traceback.clone(),
                };
                let error_val = Value::Error(self.heap.alloc_error(error_obj));
                self.stack.push(error_val);

                if let Some(frame) = self.frames.current_mut() {
                    frame.ip = recover_ip;
                    frame.is_recovering = true;
                }
                Ok(())
            }
        }
    }

    fn attach_traceback(&self, mut err: RuntimeError) -> RuntimeError {
        for frame in self.frames.iter().rev() {
            let name = frame.script().name.clone().unwrap_or_else(|| "<anonymous>".to_string());
            err = err.with_frame(TracebackFrame { name, position: err.position() });
        }
        err
    }

    pub fn runtime_error(&self, kind: VMError) -> RuntimeError {
        let pos = self.current_position();
        RuntimeError::new(kind, &pos)
    }

    pub fn current_position(&self) -> SourcePos {
        match self.frames.current() {
            Some(frame) => {
                let ip = frame.ip.min(frame.script().code.positions.len().saturating_sub(1));
                frame.script().code.position_at(ip)
            }
            None => SourcePos::unknown(),
        }
    }

    fn mark_roots(&self) {
        self.heap.mark_list(&self.global_store.values().to_vec());
        self.heap.mark_list(&self.module_globals);
        self.heap.mark_list(&self.stack);
        self.heap.mark_list(&self.this_stack);
        self.heap.mark_value(&self.last_popped);
        for frame in self.frames.iter() {
            self.heap.mark_value(&frame.function);
        }
    }

    /// §4.9.4: runs after each instruction when `heap.should_sweep()`.
    fn collect(&mut self) {
        self.heap.unmark_all();
        self.mark_roots();
        let (swept, bytes) = self.heap.sweep();
        if matches!(self.log_level, LogLevel::Debug | LogLevel::Trace) && swept > 0 {
            log::debug!("gc: reclaimed {} objects ({} bytes)", swept, bytes);
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| self.runtime_error(VMError::InternalError("data stack underflow".into())))
    }

    /// Returns the frame-local slot `base_pointer + index` without removing
    /// it from the stack (used by `GETLOCAL`/`SETLOCAL`/`DEFLOCAL`).
    pub fn local_slot(&self, index: usize) -> Result<usize, RuntimeError> {
        let bp = self
            .frames
            .current()
            .ok_or_else(|| self.runtime_error(VMError::InternalError("no active frame for local access".into())))?
            .base_pointer;
        Ok(bp + index)
    }

    pub fn dump_internal_state(&self) {
        log::trace!("==== VM internal state ====");
        for (depth, frame) in self.frames.iter().enumerate() {
            log::trace!(
                "frame #{depth}: fn={:?} ip={} bp={} recovering={}",
                frame.script().name,
                frame.ip,
                frame.base_pointer,
                frame.is_recovering
            );
        }
        log::trace!("stack: {:?}", self.stack.iter().map(Value::display_string).collect::<Vec<_>>());
        log::trace!("module globals: {}", self.module_globals.len());
    }
}

/// `Host` lets native functions allocate GC-managed values and raise user
/// errors without depending on `VirtualMachine`'s private fields.
impl Host for VirtualMachine {
    fn alloc_string(&mut self, s: String) -> Value {
        Value::Str(self.heap.alloc_string(s))
    }

    fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        Value::Array(self.heap.alloc_array(items))
    }

    fn alloc_map(&mut self, entries: Vec<(Value, Value)>) -> Result<Value, String> {
        let mut map = std::collections::HashMap::new();
        for (k, v) in entries {
            let key = crate::common::hash::HashKey::from_value(&k)?;
            map.insert(key, (k, v));
        }
        Ok(Value::Map(self.heap.alloc_map(map)))
    }

    fn raise(&mut self, message: String) -> Value {
        let err = crate::common::object::ErrorObject {
            message,
            position: self.current_position(),
            traceback: Vec::new(),
        };
        Value::Error(self.heap.alloc_error(err))
    }
}

