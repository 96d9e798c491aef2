// The compiler + VM half of the crate (§2 components 4-9).
//
// `translator` holds the symbol table and bytecode writer that the compiler
// drives; `compiler` is the AST-to-bytecode pass itself; `vm` is the
// stack-based interpreter and its GC.
pub mod translator;
pub mod compiler;
pub mod vm;
