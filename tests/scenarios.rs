// End-to-end scenarios exercising the compiler and VM together: a source
// string goes in, a `Value` comes out.
use glimmer::backend::compiler::{Compiler, ReadFile};
use glimmer::backend::vm::globals::GlobalStore;
use glimmer::backend::vm::heap::Heap;
use glimmer::backend::vm::std_lib;
use glimmer::backend::vm::{Config, VirtualMachine};
use glimmer::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

struct NoFiles;
impl ReadFile for NoFiles {
    fn read(&self, _path: &Path) -> Option<String> {
        None
    }
}

fn run(src: &str) -> Value {
    let mut builtin_heap = Heap::new(Default::default());
    let global = GlobalStore::with_builtins(std_lib::BUILTINS, &mut builtin_heap);
    let mut vm = VirtualMachine::new(global, Config::default());

    let read_file = NoFiles;
    let mut compiler = Compiler::new(&vm.global_store, &mut vm.heap, &read_file);
    let code = compiler.compile_source(src).expect("source should compile");
    let num_module_globals = compiler.num_module_globals();

    vm.run(code, num_module_globals).expect("program should run to completion")
}

#[test]
fn arithmetic() {
    let result = run("return (1 + 2) * 3;");
    assert_eq!(result, Value::Fixed(9));
}

#[test]
fn closure_shares_upvalue_across_calls() {
    let src = r#"
        var f = function() {
            var x = 10;
            return function() { x = x + 1; return x; };
        };
        var g = f();
        g();
        g();
        return g();
    "#;
    assert_eq!(run(src), Value::Fixed(13));
}

#[test]
fn map_operator_overload() {
    let src = r#"
        var m = {"__operator_add__": function(self, o) { return o + 100; }};
        return m + 5;
    "#;
    assert_eq!(run(src), Value::Fixed(105));
}

#[test]
fn recover_catches_a_crash() {
    let src = r#"
        var f = function() {
            recover (e) { return "caught:" + e.message; }
            crash("bad");
        };
        return f();
    "#;
    assert_eq!(run(src).display_string(), "caught:bad");
}

#[test]
fn foreach_over_string_concatenates_characters() {
    let src = r#"
        var s = "abc";
        var out = "";
        for (c in s) { out = out + c; }
        return out;
    "#;
    assert_eq!(run(src).display_string(), "abc");
}

struct InMemoryFiles(HashMap<PathBuf, String>);
impl ReadFile for InMemoryFiles {
    fn read(&self, path: &Path) -> Option<String> {
        self.0.get(path).cloned()
    }
}

#[test]
fn array_built_with_push_equals_the_matching_literal() {
    let src = r#"
        var a = [1, 2, 3];
        var b = [];
        b.push(1);
        b.push(2);
        b.push(3);
        return a == b;
    "#;
    assert_eq!(run(src), Value::Bool(true));
}

#[test]
fn number_literals_round_trip_through_display_string() {
    // Integral literals widen to a fixed-number (§4.9 `MKNUMBER`) and print
    // with no decimal point.
    assert_eq!(run("return 42;").display_string(), "42");
    // A genuinely fractional literal stays a float-number and prints as-is.
    assert_eq!(run("return 3.5;").display_string(), "3.5");
    // A float-number result that happens to be integral (here, the
    // subtraction of two fractional literals) still prints its `.0`, so it
    // stays visibly distinct from a fixed-number.
    assert_eq!(run("return 3.5 - 0.5;").display_string(), "3.0");
}

#[test]
fn empty_program_leaves_the_stack_and_this_stack_empty() {
    let mut builtin_heap = Heap::new(Default::default());
    let global = GlobalStore::with_builtins(std_lib::BUILTINS, &mut builtin_heap);
    let mut vm = VirtualMachine::new(global, Config::default());

    let read_file = NoFiles;
    let mut compiler = Compiler::new(&vm.global_store, &mut vm.heap, &read_file);
    let code = compiler.compile_source("").expect("empty source should compile");
    let num_module_globals = compiler.num_module_globals();

    vm.run(code, num_module_globals).expect("empty program should run to completion");
    assert_eq!(vm.stack.len(), 0);
    assert_eq!(vm.this_stack.len(), 0);
}

#[test]
fn include_cycle_is_rejected_at_the_include_statement() {
    let mut files = HashMap::new();
    files.insert(PathBuf::from("/virtual/a.ape"), "include \"b\";".to_string());
    files.insert(PathBuf::from("/virtual/b.ape"), "include \"a\";".to_string());
    let read_file = InMemoryFiles(files);

    let mut builtin_heap = Heap::new(Default::default());
    let global = GlobalStore::with_builtins(std_lib::BUILTINS, &mut builtin_heap);
    let mut heap = Heap::new(Default::default());
    let mut compiler = Compiler::new(&global, &mut heap, &read_file);

    let errors = compiler.compile_file(Path::new("/virtual/a.ape")).expect_err("a cycle must be rejected");
    assert!(errors.iter().any(|e| e.to_string().contains("cyclic")), "errors were: {errors:?}");
}
