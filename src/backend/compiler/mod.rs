// AST-to-bytecode compiler (§3.5, §3.6, §4.6, §4.7).
//
// `Compiler` drives the parser, walks the resulting `Program`, and writes
// bytecode through a `CompilationScope` while resolving identifiers through a
// stack of `SymbolTable`s. Function literals push a fresh scope/table pair;
// `include` temporarily swaps the table stack for an isolated one so an
// included file can't reach into the includer's lexical scopes, then splices
// its compiled statements directly into the includer's own bytecode.
pub mod optimizer;

use crate::backend::translator::emitter::CompilationScope;
use crate::backend::translator::scanner::{resolve, GlobalLookup, Symbol, SymbolKind, SymbolTable};
use crate::backend::vm::error::CompileError;
use crate::backend::vm::heap::Heap;
use crate::common::object::{ScriptFunction, SourcePos, Value};
use crate::common::opcode::{CompiledCode, Op, UNPATCHED_JUMP, UNPATCHED_RECOVER};
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::ast::{AssignTarget, BinOp, Expression, IncDecOp, Literal, LogicalOp, Statement, UnOp};
use crate::frontend::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// §6.4: abstracts the filesystem so `include` can be driven from tests
/// without touching disk, and so the CLI can supply the real thing.
pub trait ReadFile {
    fn read(&self, path: &Path) -> Option<String>;
}

/// The concrete `ReadFile` the CLI wires in.
pub struct FsReadFile;

impl ReadFile for FsReadFile {
    fn read(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

/// A completed `include` target's module-globals, cached by canonical path
/// so a diamond of includes only compiles the shared file once (§4.6.1).
#[derive(Clone)]
struct Module {
    name: String,
    symbols: Vec<Symbol>,
}

/// One entry per file currently being compiled (the in-memory top-level
/// source counts as one, with no `path`). `loaded` is the set of module
/// names already spliced into this file, for the include idempotence rule.
struct FileScope {
    dir: PathBuf,
    path: Option<PathBuf>,
    loaded: HashSet<String>,
}

pub struct Compiler<'a> {
    file_scopes: Vec<FileScope>,
    tables: Vec<SymbolTable>,
    scope: CompilationScope,
    global: &'a dyn GlobalLookup,
    heap: &'a mut Heap,
    read_file: &'a dyn ReadFile,
    modules: HashMap<PathBuf, Module>,
    errors: Vec<CompileError>,
}

impl<'a> Compiler<'a> {
    pub fn new(global: &'a dyn GlobalLookup, heap: &'a mut Heap, read_file: &'a dyn ReadFile) -> Self {
        Compiler {
            file_scopes: vec![FileScope { dir: PathBuf::new(), path: None, loaded: HashSet::new() }],
            tables: vec![SymbolTable::new(0, false)],
            scope: CompilationScope::new(),
            global,
            heap,
            read_file,
            modules: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// §6.3 `compile-source`: compiles a standalone in-memory program. Any
    /// `include` inside it resolves relative to the current directory.
    pub fn compile_source(&mut self, code: &str) -> Result<Rc<CompiledCode>, Vec<CompileError>> {
        self.reset(FileScope { dir: PathBuf::new(), path: None, loaded: HashSet::new() });
        self.compile_program(code);
        self.finish()
    }

    /// Compiles a file from disk, establishing its directory as the base for
    /// relative `include`s inside it.
    pub fn compile_file(&mut self, path: &Path) -> Result<Rc<CompiledCode>, Vec<CompileError>> {
        let source = match self.read_file.read(path) {
            Some(s) => s,
            None => return Err(vec![CompileError::new(format!("could not read '{}'", path.display()), &SourcePos::unknown())]),
        };
        let dir = path.parent().map(PathBuf::from).unwrap_or_default();
        self.reset(FileScope { dir, path: Some(lexical_normalize(path)), loaded: HashSet::new() });
        self.compile_program(&source);
        self.finish()
    }

    fn reset(&mut self, root: FileScope) {
        self.file_scopes = vec![root];
        self.tables = vec![SymbolTable::new(0, false)];
        self.scope = CompilationScope::new();
        self.errors.clear();
    }

    /// Number of module-global slots the just-compiled program needs — the
    /// caller reserves this many before running the returned code so
    /// `DEFMODULEGLOBAL`/`GETMODULEGLOBAL` addressing is in range from the
    /// first instruction.
    pub fn num_module_globals(&self) -> usize {
        self.tables.first().map(|t| t.max_num_definitions).unwrap_or(0)
    }

    fn finish(&mut self) -> Result<Rc<CompiledCode>, Vec<CompileError>> {
        if !self.errors.is_empty() {
            return Err(std::mem::take(&mut self.errors));
        }
        if !matches!(self.scope.last_op, Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
            let pos = SourcePos::unknown();
            self.scope.write_op(Op::ReturnNothing, &[], pos);
        }
        Ok(Rc::new(CompiledCode {
            code: self.scope.code().to_vec(),
            positions: self.scope.positions().to_vec(),
            constants: self.scope.constants().to_vec(),
        }))
    }

    fn compile_program(&mut self, code: &str) {
        let mut lexer = Lexer::new(code);
        let mut parser = Parser::new(&mut lexer);
        let program = parser.parse();

        if !parser.get_err().is_empty() {
            for err in parser.get_err() {
                self.errors.push(CompileError::new(format!("{:?}: {}", err.err_type, err.message), &self.pos()));
            }
            return;
        }

        let program = optimizer::optimize(program);
        for stmt in &program.body {
            if let Err(e) = self.compile_statement(stmt) {
                self.errors.push(e);
            }
        }
    }

    fn pos(&self) -> SourcePos {
        let file: Rc<str> = self
            .file_scopes
            .last()
            .and_then(|fs| fs.path.as_ref())
            .map(|p| Rc::from(p.display().to_string()))
            .unwrap_or_else(|| Rc::from("<source>"));
        SourcePos { file, line: 0, column: 0 }
    }

    // ---- identifier read/write/define plumbing -------------------------

    fn emit_read(&mut self, sym: &Symbol, pos: SourcePos) {
        match sym.kind {
            SymbolKind::ModuleGlobal => self.scope.write_op(Op::GetModuleGlobal, &[sym.index as u64], pos),
            SymbolKind::ContextGlobal => self.scope.write_op(Op::GetContextGlobal, &[sym.index as u64], pos),
            SymbolKind::Local => self.scope.write_op(Op::GetLocal, &[sym.index as u64], pos),
            SymbolKind::Free => self.scope.write_op(Op::GetFree, &[sym.index as u64], pos),
            SymbolKind::Function => self.scope.write_op(Op::CurrentFunction, &[], pos),
            SymbolKind::This => self.scope.write_op(Op::GetThis, &[], pos),
        };
    }

    fn emit_def(&mut self, sym: &Symbol, pos: SourcePos) {
        match sym.kind {
            SymbolKind::Local => self.scope.write_op(Op::DefLocal, &[sym.index as u64], pos),
            SymbolKind::ModuleGlobal => self.scope.write_op(Op::DefModuleGlobal, &[sym.index as u64], pos),
            _ => unreachable!("define() only produces Local or ModuleGlobal symbols"),
        };
    }

    /// `None` when `sym` has no assignment opcode at all (a built-in or a
    /// self/this reference) — distinct from `assignable == false`, which the
    /// caller checks first.
    fn emit_write(&mut self, sym: &Symbol, pos: SourcePos) -> Result<(), CompileError> {
        match sym.kind {
            SymbolKind::Local => {
                self.scope.write_op(Op::SetLocal, &[sym.index as u64], pos);
            }
            SymbolKind::ModuleGlobal => {
                self.scope.write_op(Op::SetModuleGlobal, &[sym.index as u64], pos);
            }
            SymbolKind::Free => {
                self.scope.write_op(Op::SetFree, &[sym.index as u64], pos);
            }
            SymbolKind::ContextGlobal | SymbolKind::Function | SymbolKind::This => {
                return Err(CompileError::new(format!("'{}' is not assignable", sym.name), &pos));
            }
        }
        Ok(())
    }

    fn define_hidden(&mut self, name: &str, pos: &SourcePos) -> Result<Symbol, CompileError> {
        self.tables.last_mut().unwrap().define(name, true, self.global).map_err(|e| CompileError::new(e.to_string(), pos))
    }

    // ---- statements ------------------------------------------------------

    fn compile_statement(&mut self, stmt: &Statement) -> Result<(), CompileError> {
        let pos = self.pos();
        match stmt {
            Statement::ExprStatement(e) => {
                self.compile_expression(e)?;
                self.scope.write_op(Op::Pop, &[], pos);
            }
            Statement::VarDecl { names, values } => self.compile_var_decl(names, values, pos)?,
            Statement::Assign { target, value } => {
                self.compile_assign(target, value, pos, true)?;
            }
            Statement::If { arms, else_branch } => self.compile_if(arms, else_branch, pos)?,
            Statement::While { condition, body } => self.compile_while(condition, body, pos)?,
            Statement::For { init, condition, update, body } => self.compile_for(init, condition, update, body, pos)?,
            Statement::Foreach { var_name, source, body } => self.compile_foreach(var_name, source, body, pos)?,
            Statement::Break => {
                if !self.scope.in_loop() {
                    return Err(CompileError::new("'break' outside of a loop", &pos));
                }
                let ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos);
                self.scope.add_break(ip);
            }
            Statement::Continue => {
                let target = self
                    .scope
                    .current_continue()
                    .ok_or_else(|| CompileError::new("'continue' outside of a loop", &pos))?;
                self.scope.write_op(Op::Jump, &[target as u64], pos);
            }
            Statement::Return(expr) => {
                // The top-level compiled program is itself run as a callable
                // chunk (`VirtualMachine::run` gives it a real call frame),
                // so `return` is legal there too — it just ends the chunk
                // early with a result, the same as scenario 1's bare
                // `return (1 + 2) * 3;`.
                match expr {
                    Some(e) => {
                        self.compile_expression(e)?;
                        self.scope.write_op(Op::ReturnValue, &[], pos);
                    }
                    None => {
                        self.scope.write_op(Op::ReturnNothing, &[], pos);
                    }
                }
            }
            Statement::Block(stmts) => self.compile_block_stmt(stmts, pos)?,
            Statement::Include(path) => self.compile_include(path, pos)?,
            Statement::Recover { err_name, body } => self.compile_recover(err_name, body, pos)?,
        }
        Ok(())
    }

    fn compile_var_decl(&mut self, names: &[String], values: &[Expression], pos: SourcePos) -> Result<(), CompileError> {
        for (name, value) in names.iter().zip(values.iter()) {
            self.compile_expression(value)?;
            let sym =
                self.tables.last_mut().unwrap().define(name, true, self.global).map_err(|e| CompileError::new(e.to_string(), &pos))?;
            self.emit_def(&sym, pos.clone());
        }
        Ok(())
    }

    /// §9 open question, resolved: writes to an undefined name are a compile
    /// error, never an implicit definition.
    fn compile_assign(&mut self, target: &AssignTarget, value: &Expression, pos: SourcePos, as_statement: bool) -> Result<(), CompileError> {
        match target {
            AssignTarget::Identifier(name) => {
                let sym = resolve(&mut self.tables, self.global, name)
                    .ok_or_else(|| CompileError::new(format!("unresolved symbol '{name}'"), &pos))?;
                if !sym.assignable {
                    return Err(CompileError::new(format!("'{name}' is not assignable"), &pos));
                }
                self.compile_expression(value)?;
                if !as_statement {
                    self.scope.write_op(Op::Dup, &[], pos.clone());
                }
                self.emit_write(&sym, pos)?;
            }
            AssignTarget::Index { collection, index } => {
                self.compile_expression(value)?;
                self.scope.write_op(Op::Dup, &[], pos.clone());
                self.compile_expression(collection)?;
                self.compile_expression(index)?;
                self.scope.write_op(Op::SetIndex, &[], pos.clone());
                if as_statement {
                    self.scope.write_op(Op::Pop, &[], pos);
                }
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, stmts: &[Statement]) -> Result<(), CompileError> {
        self.tables.last_mut().unwrap().push_block();
        for stmt in stmts {
            if let Err(e) = self.compile_statement(stmt) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }
        self.tables.last_mut().unwrap().pop_block();
        Ok(())
    }

    fn compile_block_stmt(&mut self, stmts: &[Statement], pos: SourcePos) -> Result<(), CompileError> {
        self.tables.last_mut().unwrap().push_block();
        if stmts.is_empty() {
            self.scope.write_op(Op::Null, &[], pos.clone());
            self.scope.write_op(Op::Pop, &[], pos);
            self.tables.last_mut().unwrap().pop_block();
            return Ok(());
        }
        for stmt in stmts {
            if let Err(e) = self.compile_statement(stmt) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }
        self.tables.last_mut().unwrap().pop_block();
        Ok(())
    }

    fn compile_if(&mut self, arms: &[(Expression, Vec<Statement>)], else_branch: &Option<Vec<Statement>>, pos: SourcePos) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        for (cond, body) in arms {
            self.compile_expression(cond)?;
            let jiff_ip = self.scope.write_op_unknown(Op::JumpIfFalse, UNPATCHED_JUMP, pos.clone());
            self.compile_block(body)?;
            let end_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());
            end_jumps.push(end_ip);
            let next_case_ip = self.scope.current_ip();
            self.scope.mod_u16_operand(jiff_ip + 1, next_case_ip as u16);
        }
        if let Some(else_body) = else_branch {
            self.compile_block(else_body)?;
        }
        let end_ip = self.scope.current_ip();
        for ip in end_jumps {
            self.scope.mod_u16_operand(ip + 1, end_ip as u16);
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expression, body: &[Statement], pos: SourcePos) -> Result<(), CompileError> {
        let test_ip = self.scope.current_ip();
        self.compile_expression(condition)?;
        let jiff_ip = self.scope.write_op_unknown(Op::JumpIfFalse, UNPATCHED_JUMP, pos.clone());
        self.scope.enter_loop(test_ip);
        self.compile_block(body)?;
        self.scope.write_op(Op::Jump, &[test_ip as u64], pos);
        let exit_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jiff_ip + 1, exit_ip as u16);
        self.scope.exit_loop(exit_ip);
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: &Option<Box<Statement>>,
        condition: &Option<Expression>,
        update: &Option<Box<Statement>>,
        body: &[Statement],
        pos: SourcePos,
    ) -> Result<(), CompileError> {
        self.tables.last_mut().unwrap().push_block();
        if let Some(s) = init {
            if let Err(e) = self.compile_statement(s) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }

        let jump_to_test_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());
        let update_ip = self.scope.current_ip();
        if let Some(s) = update {
            if let Err(e) = self.compile_statement(s) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }

        let test_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jump_to_test_ip + 1, test_ip as u16);
        match condition {
            Some(c) => self.compile_expression(c)?,
            None => {
                self.scope.write_op(Op::True, &[], pos.clone());
            }
        }
        let jiff_ip = self.scope.write_op_unknown(Op::JumpIfFalse, UNPATCHED_JUMP, pos.clone());
        self.scope.enter_loop(update_ip);
        if let Err(e) = self.compile_block(body) {
            self.tables.last_mut().unwrap().pop_block();
            return Err(e);
        }
        self.scope.write_op(Op::Jump, &[update_ip as u64], pos);
        let exit_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jiff_ip + 1, exit_ip as u16);
        self.scope.exit_loop(exit_ip);
        self.tables.last_mut().unwrap().pop_block();
        Ok(())
    }

    /// `@i = 0; jump test; update: @i += 1; test: if LEN(src) == @i jump
    /// exit else fall into body; body: var = GETVALUEAT(src, @i); ...; jump
    /// update`. `GETVALUEAT`, not `GETINDEX`, since a map's positional
    /// element is a `{key, value}` pair rather than a hash lookup.
    fn compile_foreach(&mut self, var_name: &str, source: &Expression, body: &[Statement], pos: SourcePos) -> Result<(), CompileError> {
        self.tables.last_mut().unwrap().push_block();

        let source_sym = if let Expression::Identifier(name) = source {
            match resolve(&mut self.tables, self.global, name) {
                Some(s) => Some(s),
                None => {
                    self.tables.last_mut().unwrap().pop_block();
                    return Err(CompileError::new(format!("unresolved symbol '{name}'"), &pos));
                }
            }
        } else {
            None
        };

        let source_local = if source_sym.is_none() {
            if let Err(e) = self.compile_expression(source) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
            let sym = match self.define_hidden("@source", &pos) {
                Ok(s) => s,
                Err(e) => {
                    self.tables.last_mut().unwrap().pop_block();
                    return Err(e);
                }
            };
            self.scope.write_op(Op::DefLocal, &[sym.index as u64], pos.clone());
            Some(sym)
        } else {
            None
        };

        self.scope.write_op(Op::MkNumber, &[0.0f64.to_bits()], pos.clone());
        let i_sym = match self.define_hidden("@i", &pos) {
            Ok(s) => s,
            Err(e) => {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        };
        self.scope.write_op(Op::DefLocal, &[i_sym.index as u64], pos.clone());

        let jump_to_test_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());
        let update_ip = self.scope.current_ip();
        self.scope.write_op(Op::GetLocal, &[i_sym.index as u64], pos.clone());
        self.scope.write_op(Op::MkNumber, &[1.0f64.to_bits()], pos.clone());
        self.scope.write_op(Op::Add, &[], pos.clone());
        self.scope.write_op(Op::SetLocal, &[i_sym.index as u64], pos.clone());

        let test_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jump_to_test_ip + 1, test_ip as u16);
        self.emit_foreach_source(&source_sym, &source_local, pos.clone());
        self.scope.write_op(Op::Len, &[], pos.clone());
        self.scope.write_op(Op::GetLocal, &[i_sym.index as u64], pos.clone());
        self.scope.write_op(Op::ComparePlain, &[], pos.clone());
        self.scope.write_op(Op::IsEqual, &[], pos.clone());
        let jiff_ip = self.scope.write_op_unknown(Op::JumpIfFalse, UNPATCHED_JUMP, pos.clone());
        let exit_jump_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());

        let body_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jiff_ip + 1, body_ip as u16);

        self.emit_foreach_source(&source_sym, &source_local, pos.clone());
        self.scope.write_op(Op::GetLocal, &[i_sym.index as u64], pos.clone());
        self.scope.write_op(Op::GetValueAt, &[], pos.clone());
        let var_sym = match self.tables.last_mut().unwrap().define(var_name, true, self.global) {
            Ok(s) => s,
            Err(e) => {
                self.tables.last_mut().unwrap().pop_block();
                return Err(CompileError::new(e.to_string(), &pos));
            }
        };
        self.emit_def(&var_sym, pos.clone());

        self.scope.enter_loop(update_ip);
        if let Err(e) = self.compile_block(body) {
            self.tables.last_mut().unwrap().pop_block();
            return Err(e);
        }
        self.scope.write_op(Op::Jump, &[update_ip as u64], pos);

        let exit_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(exit_jump_ip + 1, exit_ip as u16);
        self.scope.exit_loop(exit_ip);

        self.tables.last_mut().unwrap().pop_block();
        Ok(())
    }

    fn emit_foreach_source(&mut self, source_sym: &Option<Symbol>, source_local: &Option<Symbol>, pos: SourcePos) {
        if let Some(sym) = source_local {
            self.scope.write_op(Op::GetLocal, &[sym.index as u64], pos);
        } else if let Some(sym) = source_sym {
            self.emit_read(sym, pos);
        }
    }

    /// Legal only at the top of the block of a function body (§4.6.1):
    /// `SETRECOVER handler; JUMP after; handler: DEFLOCAL err; <body>;
    /// after:`. The body must end in a `return` — `recover` re-enters
    /// execution after an error, so falling off its end would leave the VM
    /// nowhere to go.
    fn compile_recover(&mut self, err_name: &str, body: &[Statement], pos: SourcePos) -> Result<(), CompileError> {
        if self.tables.len() == 1 {
            return Err(CompileError::new("'recover' is not allowed at module-global scope", &pos));
        }
        if !self.tables.last().unwrap().is_single_block() {
            return Err(CompileError::new("'recover' must be the first statement in its function body", &pos));
        }

        let setrecover_ip = self.scope.write_op_unknown(Op::SetRecover, UNPATCHED_RECOVER, pos.clone());
        let jump_over_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());
        let handler_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(setrecover_ip + 1, handler_ip as u16);

        self.tables.last_mut().unwrap().push_block();
        let err_sym = match self.tables.last_mut().unwrap().define(err_name, true, self.global) {
            Ok(s) => s,
            Err(e) => {
                self.tables.last_mut().unwrap().pop_block();
                return Err(CompileError::new(e.to_string(), &pos));
            }
        };
        self.emit_def(&err_sym, pos.clone());

        for stmt in body {
            if let Err(e) = self.compile_statement(stmt) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }
        if !matches!(self.scope.last_op, Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
            self.tables.last_mut().unwrap().pop_block();
            return Err(CompileError::new("'recover' body must end with a return", &pos));
        }
        self.tables.last_mut().unwrap().pop_block();

        let after_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jump_over_ip + 1, after_ip as u16);
        Ok(())
    }

    // ---- include (§4.6.1) ------------------------------------------------

    fn compile_include(&mut self, raw_path: &str, pos: SourcePos) -> Result<(), CompileError> {
        if self.tables.len() != 1 || !self.tables.last().unwrap().is_single_block() {
            return Err(CompileError::new("'include' is only legal at module-global scope", &pos));
        }

        let canonical = self.canonicalize_include_path(raw_path);
        let module_name = canonical.file_stem().and_then(|s| s.to_str()).unwrap_or(raw_path).to_string();

        if self.file_scopes.last().unwrap().loaded.contains(&module_name) {
            return Ok(());
        }
        if self.file_scopes.iter().any(|fs| fs.path.as_deref() == Some(canonical.as_path())) {
            return Err(CompileError::new(format!("cyclic reference including '{raw_path}'"), &pos));
        }

        let module = match self.modules.get(&canonical) {
            Some(m) => m.clone(),
            None => self.compile_include_module(&canonical, &module_name, raw_path, &pos)?,
        };

        self.file_scopes.last_mut().unwrap().loaded.insert(module_name.clone());
        let current_table = self.tables.last_mut().unwrap();
        for sym in &module.symbols {
            let qualified = format!("{}::{}", module.name, sym.name);
            current_table.alias(&qualified, sym);
        }
        Ok(())
    }

    /// Compiles the included file's top-level statements directly into the
    /// includer's own `CompilationScope` (they are just more top-level
    /// statements, not a callable blob), using a fully-isolated symbol table
    /// so the included file cannot resolve identifiers from the includer's
    /// enclosing scopes.
    fn compile_include_module(&mut self, canonical: &Path, module_name: &str, raw_path: &str, pos: &SourcePos) -> Result<Module, CompileError> {
        let source = self
            .read_file
            .read(canonical)
            .ok_or_else(|| CompileError::new(format!("could not read include target '{raw_path}'"), pos))?;

        let dir = canonical.parent().map(PathBuf::from).unwrap_or_default();
        self.file_scopes.push(FileScope { dir, path: Some(canonical.to_path_buf()), loaded: HashSet::new() });

        let offset = self.tables.last().unwrap().next_index();
        let saved_tables = std::mem::replace(&mut self.tables, vec![SymbolTable::new(offset, false)]);

        let mut lexer = Lexer::new(&source);
        let mut parser = Parser::new(&mut lexer);
        let program = parser.parse();

        let mut first_error = None;
        if !parser.get_err().is_empty() {
            let e = parser.get_err().first().unwrap();
            first_error = Some(CompileError::new(format!("{:?}: {}", e.err_type, e.message), pos));
        } else {
            let program = optimizer::optimize(program);
            for stmt in &program.body {
                if let Err(e) = self.compile_statement(stmt) {
                    first_error = Some(e);
                    break;
                }
            }
        }

        let mut included_tables = std::mem::replace(&mut self.tables, saved_tables);
        self.file_scopes.pop();

        if let Some(e) = first_error {
            return Err(e);
        }

        let included_table = included_tables.pop().unwrap();
        let module = Module { name: module_name.to_string(), symbols: included_table.module_globals.clone() };
        self.modules.insert(canonical.to_path_buf(), module.clone());
        Ok(module)
    }

    fn canonicalize_include_path(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        let with_ext = if p.is_absolute() {
            PathBuf::from(format!("{raw}.ape"))
        } else {
            let dir = &self.file_scopes.last().unwrap().dir;
            PathBuf::from(format!("{}.ape", dir.join(raw).display()))
        };
        lexical_normalize(&with_ext)
    }

    // ---- expressions -------------------------------------------------------

    fn compile_expression(&mut self, expr: &Expression) -> Result<(), CompileError> {
        let pos = self.pos();
        match expr {
            Expression::Identifier(name) => self.compile_identifier(name, pos),
            Expression::Literal(lit) => self.compile_literal(lit, pos),
            Expression::Binary { left, operator, right } => self.compile_binary(left, *operator, right, pos),
            Expression::Logical { left, operator, right } => self.compile_logical(left, *operator, right, pos),
            Expression::Unary { operator, operand } => self.compile_unary(*operator, operand, pos),
            Expression::Ternary { condition, then_branch, else_branch } => self.compile_ternary(condition, then_branch, else_branch, pos),
            Expression::Call { callee, arguments } => self.compile_call(callee, arguments, pos),
            Expression::Index { collection, index } => {
                self.compile_expression(collection)?;
                self.compile_expression(index)?;
                self.scope.write_op(Op::GetIndex, &[], pos);
                Ok(())
            }
            Expression::Array(items) => {
                for item in items {
                    self.compile_expression(item)?;
                }
                self.scope.write_op(Op::MkArray, &[items.len() as u64], pos);
                Ok(())
            }
            Expression::MapLit(pairs) => self.compile_map_lit(pairs, pos),
            Expression::FunctionLit { name, params, body } => self.compile_function_lit(name.as_deref(), params, body, pos),
            Expression::PostfixIncDec { target, operator } => self.compile_postfix(target, *operator, pos),
            Expression::Assign { target, value } => self.compile_assign(target, value, pos, false),
        }
    }

    fn compile_identifier(&mut self, name: &str, pos: SourcePos) -> Result<(), CompileError> {
        let free_before = self.tables.last().unwrap().free_symbols.len();
        let sym = resolve(&mut self.tables, self.global, name).ok_or_else(|| CompileError::new(format!("unresolved symbol '{name}'"), &pos))?;
        if name == "this" {
            let free_after = self.tables.last().unwrap().free_symbols.len();
            if free_after == free_before {
                self.scope.write_op(Op::GetThis, &[], pos);
                return Ok(());
            }
        }
        self.emit_read(&sym, pos);
        Ok(())
    }

    fn compile_literal(&mut self, lit: &Literal, pos: SourcePos) -> Result<(), CompileError> {
        match lit {
            Literal::Number(n) => {
                self.scope.write_op(Op::MkNumber, &[n.to_bits()], pos);
            }
            Literal::String(s) => {
                let ix = match self.scope.string_index(s) {
                    Some(ix) => ix,
                    None => {
                        let value = Value::Str(self.heap.alloc_string(s.clone()));
                        self.scope.push_string_constant(s, value)
                    }
                };
                self.scope.write_op(Op::Constant, &[ix as u64], pos);
            }
            Literal::Boolean(b) => {
                self.scope.write_op(if *b { Op::True } else { Op::False }, &[], pos);
            }
            Literal::Null => {
                self.scope.write_op(Op::Null, &[], pos);
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, left: &Expression, op: BinOp, right: &Expression, pos: SourcePos) -> Result<(), CompileError> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::BitOr | BinOp::BitXor | BinOp::BitAnd | BinOp::LShift | BinOp::RShift => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                let opcode = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::BitOr => Op::BitOr,
                    BinOp::BitXor => Op::BitXor,
                    BinOp::BitAnd => Op::BitAnd,
                    BinOp::LShift => Op::LShift,
                    BinOp::RShift => Op::RShift,
                    _ => unreachable!(),
                };
                self.scope.write_op(opcode, &[], pos);
            }
            BinOp::Eq | BinOp::Neq => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                self.scope.write_op(Op::CompareEqual, &[], pos.clone());
                self.scope.write_op(if op == BinOp::Eq { Op::IsEqual } else { Op::NotEqual }, &[], pos);
            }
            BinOp::Lt | BinOp::Leq => {
                self.compile_expression(right)?;
                self.compile_expression(left)?;
                self.scope.write_op(Op::ComparePlain, &[], pos.clone());
                self.scope.write_op(if op == BinOp::Lt { Op::GreaterThan } else { Op::GreaterEqual }, &[], pos);
            }
            BinOp::Gt | BinOp::Geq => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                self.scope.write_op(Op::ComparePlain, &[], pos.clone());
                self.scope.write_op(if op == BinOp::Gt { Op::GreaterThan } else { Op::GreaterEqual }, &[], pos);
            }
        }
        Ok(())
    }

    fn compile_logical(&mut self, left: &Expression, op: LogicalOp, right: &Expression, pos: SourcePos) -> Result<(), CompileError> {
        self.compile_expression(left)?;
        self.scope.write_op(Op::Dup, &[], pos.clone());
        let jump_op = match op {
            LogicalOp::And => Op::JumpIfFalse,
            LogicalOp::Or => Op::JumpIfTrue,
        };
        let jump_ip = self.scope.write_op_unknown(jump_op, UNPATCHED_JUMP, pos.clone());
        self.scope.write_op(Op::Pop, &[], pos.clone());
        self.compile_expression(right)?;
        let end_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jump_ip + 1, end_ip as u16);
        Ok(())
    }

    fn compile_unary(&mut self, op: UnOp, operand: &Expression, pos: SourcePos) -> Result<(), CompileError> {
        self.compile_expression(operand)?;
        self.scope.write_op(if op == UnOp::Neg { Op::Minus } else { Op::Not }, &[], pos);
        Ok(())
    }

    fn compile_ternary(&mut self, condition: &Expression, then_branch: &Expression, else_branch: &Expression, pos: SourcePos) -> Result<(), CompileError> {
        self.compile_expression(condition)?;
        let jiff_ip = self.scope.write_op_unknown(Op::JumpIfFalse, UNPATCHED_JUMP, pos.clone());
        self.compile_expression(then_branch)?;
        let jump_ip = self.scope.write_op_unknown(Op::Jump, UNPATCHED_JUMP, pos.clone());
        let else_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jiff_ip + 1, else_ip as u16);
        self.compile_expression(else_branch)?;
        let end_ip = self.scope.current_ip();
        self.scope.mod_u16_operand(jump_ip + 1, end_ip as u16);
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expression, arguments: &[Expression], pos: SourcePos) -> Result<(), CompileError> {
        self.compile_expression(callee)?;
        for arg in arguments {
            self.compile_expression(arg)?;
        }
        self.scope.write_op(Op::Call, &[arguments.len() as u64], pos);
        Ok(())
    }

    /// A map literal defines `this` over its own values so a field that is
    /// itself a function literal can self-reference the map under
    /// construction (pseudo-methods, §4.6 "Maps"/"this").
    fn compile_map_lit(&mut self, pairs: &[(Expression, Expression)], pos: SourcePos) -> Result<(), CompileError> {
        self.scope.write_op(Op::MapStart, &[pairs.len() as u64], pos.clone());
        self.tables.last_mut().unwrap().push_block();
        self.tables.last_mut().unwrap().define_this();
        for (key, value) in pairs {
            if let Err(e) = self.compile_expression(key) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
            if let Err(e) = self.compile_expression(value) {
                self.tables.last_mut().unwrap().pop_block();
                return Err(e);
            }
        }
        self.tables.last_mut().unwrap().pop_block();
        self.scope.write_op(Op::MapEnd, &[pairs.len() as u64], pos);
        Ok(())
    }

    fn compile_function_lit(&mut self, name: Option<&str>, params: &[String], body: &[Statement], pos: SourcePos) -> Result<(), CompileError> {
        self.tables.push(SymbolTable::new(0, true));
        let owned = std::mem::replace(&mut self.scope, CompilationScope::new());
        self.scope = owned.push_function();

        if let Some(fname) = name {
            self.tables.last_mut().unwrap().define_function_name(fname);
        }
        for param in params {
            if let Err(e) = self.tables.last_mut().unwrap().define(param, true, self.global) {
                return self.abort_function_lit(CompileError::new(e.to_string(), &pos));
            }
        }

        for stmt in body {
            if let Err(e) = self.compile_statement(stmt) {
                return self.abort_function_lit(e);
            }
        }
        if !matches!(self.scope.last_op, Some(Op::ReturnValue) | Some(Op::ReturnNothing)) {
            self.scope.write_op(Op::ReturnNothing, &[], pos.clone());
        }

        let inner_table = self.tables.pop().unwrap();
        let num_locals = inner_table.max_num_definitions;
        let free_names: Vec<String> = inner_table.free_symbols.iter().map(|s| s.name.clone()).collect();

        let owned = std::mem::replace(&mut self.scope, CompilationScope::new());
        let (code, positions, constants, outer_scope) = owned.pop_function();
        self.scope = outer_scope;

        let compiled = CompiledCode { code, positions, constants };
        let prototype =
            ScriptFunction { name: name.map(|s| s.to_string()), code: Rc::new(compiled), num_locals, num_args: params.len(), free_vars: vec![] };
        let function_value = Value::Function(self.heap.alloc_function(prototype));
        let const_ix = self.scope.add_constant(function_value);

        for free_name in &free_names {
            if free_name == "this" {
                self.scope.write_op(Op::GetThis, &[], pos.clone());
                continue;
            }
            let sym =
                resolve(&mut self.tables, self.global, free_name).ok_or_else(|| CompileError::new(format!("unresolved free variable '{free_name}'"), &pos))?;
            self.emit_read(&sym, pos.clone());
        }

        self.scope.write_op(Op::MkFunction, &[const_ix as u64, free_names.len() as u64], pos);
        Ok(())
    }

    /// Unwinds the half-built function scope/table on a compile error so the
    /// rest of the program (if the caller keeps going) sees consistent state.
    fn abort_function_lit(&mut self, err: CompileError) -> Result<(), CompileError> {
        self.tables.pop();
        let owned = std::mem::replace(&mut self.scope, CompilationScope::new());
        let (_, _, _, outer_scope) = owned.pop_function();
        self.scope = outer_scope;
        Err(err)
    }

    fn compile_postfix(&mut self, target: &AssignTarget, op: IncDecOp, pos: SourcePos) -> Result<(), CompileError> {
        let name = match target {
            AssignTarget::Identifier(n) => n,
            AssignTarget::Index { .. } => {
                return Err(CompileError::new("postfix increment/decrement on indexed targets is not supported", &pos));
            }
        };
        let sym = resolve(&mut self.tables, self.global, name).ok_or_else(|| CompileError::new(format!("unresolved symbol '{name}'"), &pos))?;
        if !sym.assignable {
            return Err(CompileError::new(format!("'{name}' is not assignable"), &pos));
        }

        self.emit_read(&sym, pos.clone());
        self.scope.write_op(Op::Dup, &[], pos.clone());
        self.scope.write_op(Op::MkNumber, &[1.0f64.to_bits()], pos.clone());
        self.scope.write_op(if op == IncDecOp::Inc { Op::Add } else { Op::Sub }, &[], pos.clone());
        self.emit_write(&sym, pos)?;
        Ok(())
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vm::globals::GlobalStore;
    use crate::backend::vm::heap::Heap;

    struct NoFiles;
    impl ReadFile for NoFiles {
        fn read(&self, _path: &Path) -> Option<String> {
            None
        }
    }

    fn compile(src: &str) -> Result<Rc<CompiledCode>, Vec<CompileError>> {
        let mut builtin_heap = Heap::new(Default::default());
        let global = GlobalStore::with_builtins(crate::backend::vm::std_lib::BUILTINS, &mut builtin_heap);
        let mut heap = Heap::new(Default::default());
        let read_file = NoFiles;
        let mut compiler = Compiler::new(&global, &mut heap, &read_file);
        compiler.compile_source(src)
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let result = compile("1 + 2 * 3;");
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_assignment_to_undefined_name() {
        let result = compile("x = 5;");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let result = compile("break;");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_recover_at_module_scope() {
        let result = compile("recover (e) { return e; }");
        assert!(result.is_err());
    }

    #[test]
    fn compiles_function_literal_and_call() {
        let result = compile("var add = function(a, b) { return a + b; }; add(1, 2);");
        assert!(result.is_ok());
    }

    #[test]
    fn compiles_foreach_over_array() {
        let result = compile("var xs = [1, 2, 3]; foreach (x in xs) { print(x); }");
        assert!(result.is_ok());
    }

    #[test]
    fn include_rejected_inside_a_function() {
        // No filesystem backing in this test; `include` itself reads through
        // `ReadFile`, so a missing file surfaces as a read error rather than
        // a cycle — this just exercises the module-scope legality check.
        let result = compile("function f() { include \"a\"; }");
        assert!(result.is_err());
    }

    struct OneModule;
    impl ReadFile for OneModule {
        fn read(&self, path: &Path) -> Option<String> {
            (path == Path::new("m.ape")).then(|| "var x = 1;".to_string())
        }
    }

    fn num_module_globals_after(src: &str) -> usize {
        let mut builtin_heap = Heap::new(Default::default());
        let global = GlobalStore::with_builtins(crate::backend::vm::std_lib::BUILTINS, &mut builtin_heap);
        let mut heap = Heap::new(Default::default());
        let read_file = OneModule;
        let mut compiler = Compiler::new(&global, &mut heap, &read_file);
        compiler.compile_source(src).expect("source should compile");
        compiler.num_module_globals()
    }

    #[test]
    fn including_the_same_module_twice_does_not_duplicate_its_globals() {
        let once = num_module_globals_after("include \"m\"; return m::x;");
        let twice = num_module_globals_after("include \"m\"; include \"m\"; return m::x;");
        assert_eq!(once, twice, "a repeated include must not re-register the module's globals");
    }
}
