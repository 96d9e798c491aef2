// Glimmer CLI: compile a `.ape` source file and run it (§6.7).
use clap::Parser;
use glimmer::backend::compiler::{Compiler, FsReadFile};
use glimmer::backend::vm::globals::GlobalStore;
use glimmer::backend::vm::heap::Heap;
use glimmer::backend::vm::std_lib;
use glimmer::backend::vm::{Config, LogLevel, VirtualMachine};
use glimmer::common::opcode::{CompiledCode, Op};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "glimmerc")]
#[command(version = "0.1.0")]
#[command(about = "Glimmer: compile and run a script", long_about = None)]
struct Cli {
    /// Path to the `.ape` source file to compile and run.
    input: PathBuf,

    #[arg(short, long, value_enum, default_value_t = LogLevel::Release)]
    mode: LogLevel,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.mode);

    let mut builtin_heap = Heap::new(Default::default());
    let global = GlobalStore::with_builtins(std_lib::BUILTINS, &mut builtin_heap);

    let mut vm = VirtualMachine::new(global, Config::default());
    vm.log_level = cli.mode;

    let read_file = FsReadFile;
    let mut compiler = Compiler::new(&vm.global_store, &mut vm.heap, &read_file);

    let code = match compiler.compile_file(&cli.input) {
        Ok(code) => code,
        Err(errors) => {
            for err in &errors {
                eprintln!("{err}");
            }
            return ExitCode::FAILURE;
        }
    };
    let num_module_globals = compiler.num_module_globals();

    if matches!(cli.mode, LogLevel::Trace) {
        dump_bytecode(&code);
    }

    match vm.run(code, num_module_globals) {
        Ok(value) => {
            if !matches!(value, glimmer::Value::Null) {
                println!("{}", value.display_string());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            for frame in &err.traceback {
                eprintln!("  at {} ({}:{}:{})", frame.name, frame.position.file, frame.position.line, frame.position.column);
            }
            ExitCode::FAILURE
        }
    }
}

/// `--mode trace`'s bytecode listing: one line per instruction plus the
/// constant pool, logged ahead of execution (§6.7).
fn dump_bytecode(code: &CompiledCode) {
    log::trace!("==== bytecode ====");
    let mut ip = 0;
    while ip < code.code.len() {
        let Some(op) = Op::from_u8(code.code[ip]) else {
            log::trace!("{ip:04}  <unknown opcode {}>", code.code[ip]);
            break;
        };
        let width = op.instruction_width();
        let operands = &code.code[ip + 1..ip + width];
        log::trace!("{ip:04}  {:<14} {operands:?}", op.mnemonic());
        ip += width;
    }
    log::trace!("==== constants ({}) ====", code.constants.len());
    for (i, value) in code.constants.iter().enumerate() {
        log::trace!("  [{i}] {}", value.display_string());
    }
}

fn init_logging(mode: LogLevel) {
    let level = match mode {
        LogLevel::Release => log::LevelFilter::Warn,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Trace => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}
