// Lexer and parser (§2 "out of scope" collaborators #1): produces the AST
// the compiler (`backend::compiler`) consumes. Glimmer compiles AST directly
// to bytecode in one pass, so there is no separate IR stage here.
pub mod lexer;
pub mod parser;
