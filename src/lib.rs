//! Glimmer: an embeddable scripting language core.
//!
//! This crate is the compiler + virtual machine + object/GC substrate for
//! Glimmer, a small dynamically-typed language with closures, `include`-style
//! modules, and a structured `recover` construct. The lexer and parser here
//! are the ambient frontend that feeds the compiler; the hard part — symbol
//! resolution, bytecode emission, and the mark-sweep VM — lives under
//! `backend`.

pub mod common;
pub mod backend;
pub mod frontend;

pub use backend::compiler::Compiler;
pub use backend::vm::{VirtualMachine, LogLevel};
pub use common::object::Value;
